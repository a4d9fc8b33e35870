use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::CoreConfig;
use crate::error::Result;
use crate::hash::{ObjectId, Prefix};
use crate::odb::{Backend, Odb};
use crate::types::{ObjectType, RawObject};

/// alternates nest at most this deep
pub const MAX_ALTERNATE_DEPTH: usize = 5;

/// another repository's object database, borrowed read-only
pub struct Alternate {
    odb: Odb,
}

impl Alternate {
    pub fn objects_dir(&self) -> &Path {
        self.odb.objects_dir()
    }
}

impl Backend for Alternate {
    fn describe(&self) -> String {
        format!("alternate {}", self.odb.objects_dir().display())
    }

    fn read(&self, id: &ObjectId) -> Result<RawObject> {
        self.odb.read(id)
    }

    fn read_header(&self, id: &ObjectId) -> Result<(ObjectType, u64)> {
        self.odb.read_header(id)
    }

    fn exists(&self, id: &ObjectId) -> bool {
        self.odb.exists(id)
    }

    fn find_prefix(&self, prefix: &Prefix) -> Result<Vec<ObjectId>> {
        self.odb.find_prefix(prefix)
    }

    fn ids(&self) -> Box<dyn Iterator<Item = Result<ObjectId>> + '_> {
        Box::new(self.odb.iter())
    }

    fn refresh(&self) -> Result<()> {
        self.odb.refresh()
    }
}

/// parse `objects/info/alternates`: one objects directory per line, relative
/// paths taken from `objects_dir`, blank lines and `#` comments ignored
pub fn parse_alternates(objects_dir: &Path, content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let path = Path::new(line);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                objects_dir.join(path)
            }
        })
        .collect()
}

/// open the alternates listed for `objects_dir`
///
/// `chain` holds the directories already open on the way here, which stops
/// both cycles and nesting beyond `MAX_ALTERNATE_DEPTH`.
pub(crate) fn load(objects_dir: &Path, config: &CoreConfig, chain: &[PathBuf]) -> Result<Vec<Alternate>> {
    let list_path = objects_dir.join("info").join("alternates");
    let Some(content) = crate::fs::read_optional(&list_path)? else {
        return Ok(vec![]);
    };
    let content = String::from_utf8_lossy(&content);

    let mut alternates = Vec::new();
    for dir in parse_alternates(objects_dir, &content) {
        let canonical = dir.canonicalize().unwrap_or_else(|_| dir.clone());
        if chain.contains(&canonical) {
            warn!(alternate = %dir.display(), "alternates form a cycle, ignoring");
            continue;
        }
        if chain.len() >= MAX_ALTERNATE_DEPTH {
            warn!(alternate = %dir.display(), "alternates nested too deep, ignoring");
            continue;
        }
        if !dir.is_dir() {
            warn!(alternate = %dir.display(), "alternate object directory missing");
            continue;
        }

        let mut nested = chain.to_vec();
        nested.push(canonical);
        let odb = Odb::open_nested(&dir, config, &nested)?;
        alternates.push(Alternate { odb });
    }
    Ok(alternates)
}
