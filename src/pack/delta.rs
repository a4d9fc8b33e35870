/// largest literal a single insert instruction carries
const MAX_INSERT: usize = 0x7f;
/// copies are emitted in chunks of this size (a zero size field means 0x10000)
const COPY_CHUNK: u64 = 0x10000;

/// failure applying a delta stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("delta stream truncated")]
    Truncated,
    #[error("reserved delta opcode 0x00")]
    ReservedOpcode,
    #[error("delta expects a {expected} byte base, got {actual}")]
    SourceLength { expected: u64, actual: u64 },
    #[error("copy of {len} bytes at {offset} is outside the {base_len} byte base")]
    CopyOutOfRange { offset: u64, len: u64, base_len: u64 },
    #[error("delta produced {actual} bytes, header declares {expected}")]
    TargetLength { expected: u64, actual: u64 },
}

/// one delta instruction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// copy `len` bytes from the base starting at `offset`
    Copy { offset: u64, len: u64 },
    /// emit the literal bytes
    Insert(Vec<u8>),
}

/// a delta: base length, target length and the instructions turning one into
/// the other
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    pub source_len: u64,
    pub target_len: u64,
    pub instructions: Vec<Instruction>,
}

impl Delta {
    pub fn new(source_len: u64, target_len: u64, instructions: Vec<Instruction>) -> Self {
        Self {
            source_len,
            target_len,
            instructions,
        }
    }

    /// serialize to the on-disk instruction stream
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(self.source_len, &mut out);
        write_varint(self.target_len, &mut out);

        for instruction in &self.instructions {
            match instruction {
                Instruction::Insert(data) => {
                    for chunk in data.chunks(MAX_INSERT) {
                        out.push(chunk.len() as u8);
                        out.extend_from_slice(chunk);
                    }
                }
                Instruction::Copy { offset, len } => {
                    let mut offset = *offset;
                    let mut remaining = *len;
                    while remaining > 0 {
                        let chunk = remaining.min(COPY_CHUNK);
                        encode_copy(offset, chunk, &mut out);
                        offset += chunk;
                        remaining -= chunk;
                    }
                }
            }
        }
        out
    }

    /// parse an instruction stream without applying it
    pub fn parse(data: &[u8]) -> Result<Self, DeltaError> {
        let mut pos = 0;
        let source_len = read_varint(data, &mut pos)?;
        let target_len = read_varint(data, &mut pos)?;

        let mut instructions = Vec::new();
        while pos < data.len() {
            let op = data[pos];
            pos += 1;
            if op & 0x80 != 0 {
                let (offset, len) = decode_copy(op, data, &mut pos)?;
                instructions.push(Instruction::Copy { offset, len });
            } else if op != 0 {
                let end = pos + op as usize;
                let literal = data.get(pos..end).ok_or(DeltaError::Truncated)?;
                instructions.push(Instruction::Insert(literal.to_vec()));
                pos = end;
            } else {
                return Err(DeltaError::ReservedOpcode);
            }
        }

        Ok(Self {
            source_len,
            target_len,
            instructions,
        })
    }
}

/// reconstruct the target from `base` and a delta instruction stream
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0;
    let source_len = read_varint(delta, &mut pos)?;
    let target_len = read_varint(delta, &mut pos)?;

    if source_len != base.len() as u64 {
        return Err(DeltaError::SourceLength {
            expected: source_len,
            actual: base.len() as u64,
        });
    }

    // never trust a declared size for the up-front allocation
    let mut out = Vec::with_capacity(target_len.min(16 << 20) as usize);

    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;

        if op & 0x80 != 0 {
            let (offset, len) = decode_copy(op, delta, &mut pos)?;
            let end = offset
                .checked_add(len)
                .filter(|&end| end <= base.len() as u64)
                .ok_or(DeltaError::CopyOutOfRange {
                    offset,
                    len,
                    base_len: base.len() as u64,
                })?;
            out.extend_from_slice(&base[offset as usize..end as usize]);
        } else if op != 0 {
            let end = pos + op as usize;
            let literal = delta.get(pos..end).ok_or(DeltaError::Truncated)?;
            out.extend_from_slice(literal);
            pos = end;
        } else {
            return Err(DeltaError::ReservedOpcode);
        }

        if out.len() as u64 > target_len {
            break;
        }
    }

    if out.len() as u64 != target_len {
        return Err(DeltaError::TargetLength {
            expected: target_len,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

/// read the (source, target) lengths at the start of a delta stream
pub fn delta_sizes(delta: &[u8]) -> Result<(u64, u64), DeltaError> {
    let mut pos = 0;
    let source = read_varint(delta, &mut pos)?;
    let target = read_varint(delta, &mut pos)?;
    Ok((source, target))
}

/// cheap delta: copy the common prefix and suffix, insert the middle
///
/// this is not a similarity search; it is enough for appends, truncations and
/// local edits.
pub fn diff(base: &[u8], target: &[u8]) -> Delta {
    let prefix = base
        .iter()
        .zip(target)
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = base.len().min(target.len()) - prefix;
    let suffix = base
        .iter()
        .rev()
        .zip(target.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    // copy offsets are limited to 32 bits
    let addressable = base.len() as u64 <= u32::MAX as u64;

    let mut instructions = Vec::new();
    if addressable && prefix > 0 {
        instructions.push(Instruction::Copy {
            offset: 0,
            len: prefix as u64,
        });
    }
    let (lit_start, lit_end) = if addressable {
        (prefix, target.len() - suffix)
    } else {
        (0, target.len())
    };
    if lit_end > lit_start {
        instructions.push(Instruction::Insert(target[lit_start..lit_end].to_vec()));
    }
    if addressable && suffix > 0 {
        instructions.push(Instruction::Copy {
            offset: (base.len() - suffix) as u64,
            len: suffix as u64,
        });
    }

    Delta::new(base.len() as u64, target.len() as u64, instructions)
}

fn encode_copy(offset: u64, len: u64, out: &mut Vec<u8>) {
    let op_pos = out.len();
    out.push(0x80);
    let mut op = 0x80u8;

    for i in 0..4 {
        let byte = ((offset >> (8 * i)) & 0xff) as u8;
        if byte != 0 {
            op |= 1 << i;
            out.push(byte);
        }
    }
    // a full chunk is written with no size bytes at all
    let size = if len == COPY_CHUNK { 0 } else { len };
    for i in 0..3 {
        let byte = ((size >> (8 * i)) & 0xff) as u8;
        if byte != 0 {
            op |= 1 << (4 + i);
            out.push(byte);
        }
    }
    out[op_pos] = op;
}

fn decode_copy(op: u8, data: &[u8], pos: &mut usize) -> Result<(u64, u64), DeltaError> {
    let mut offset = 0u64;
    for i in 0..4 {
        if op & (1 << i) != 0 {
            let byte = *data.get(*pos).ok_or(DeltaError::Truncated)?;
            *pos += 1;
            offset |= (byte as u64) << (8 * i);
        }
    }
    let mut len = 0u64;
    for i in 0..3 {
        if op & (1 << (4 + i)) != 0 {
            let byte = *data.get(*pos).ok_or(DeltaError::Truncated)?;
            *pos += 1;
            len |= (byte as u64) << (8 * i);
        }
    }
    if len == 0 {
        len = COPY_CHUNK;
    }
    Ok((offset, len))
}

/// little-endian base-128 varint used for the delta lengths
fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let byte = *data.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;
        if shift > 63 {
            return Err(DeltaError::Truncated);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
