use bstr::{BString, ByteSlice};

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::types::commit::{push_header, split_headers};
use crate::types::{ObjectType, Signature};

/// an annotated tag object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub target: ObjectId,
    pub target_type: ObjectType,
    pub name: BString,
    pub tagger: Option<Signature>,
    pub message: BString,
}

impl Tag {
    pub fn new(
        target: ObjectId,
        target_type: ObjectType,
        name: impl Into<BString>,
        tagger: Option<Signature>,
        message: impl Into<BString>,
    ) -> Self {
        Self {
            target,
            target_type,
            name: name.into(),
            tagger,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_header(&mut out, b"object", self.target.to_hex().as_bytes());
        push_header(&mut out, b"type", self.target_type.as_str().as_bytes());
        push_header(&mut out, b"tag", &self.name);
        if let Some(tagger) = &self.tagger {
            push_header(&mut out, b"tagger", &tagger.to_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    pub fn decode(id: &ObjectId, data: &[u8]) -> Result<Self> {
        let corrupt = |msg: &str| Error::corrupt_object(*id, format!("tag: {msg}"));
        let (headers, message) = split_headers(data).ok_or_else(|| corrupt("missing header end"))?;

        let mut target = None;
        let mut target_type = None;
        let mut name = None;
        let mut tagger = None;

        for (key, value) in headers {
            match key {
                b"object" => {
                    let hex = value.to_str().map_err(|_| corrupt("bad object id"))?;
                    target = Some(
                        ObjectId::from_hex_kind(id.kind(), hex)
                            .map_err(|_| corrupt("bad object id"))?,
                    )
                }
                b"type" => {
                    let kind = value.to_str().map_err(|_| corrupt("bad type"))?;
                    target_type = Some(ObjectType::try_from(kind).map_err(|_| corrupt("bad type"))?)
                }
                b"tag" => name = Some(value),
                b"tagger" => {
                    tagger = Some(Signature::parse(&value).map_err(|_| corrupt("bad tagger"))?)
                }
                _ => {}
            }
        }

        Ok(Self {
            target: target.ok_or_else(|| corrupt("missing object"))?,
            target_type: target_type.ok_or_else(|| corrupt("missing type"))?,
            name: name.ok_or_else(|| corrupt("missing tag name"))?,
            tagger,
            message: BString::from(message),
        })
    }
}
