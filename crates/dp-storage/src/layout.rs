//! Landing-zone directory layout and path classification.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::error;

use crate::rel_key;

/// Extensions of conversion scripts, in publish order.
pub const SCRIPT_EXTENSIONS: [&str; 4] = ["jl", "m", "py", "r"];

pub const CONVERSION_STEM: &str = "conversion";
pub const RAW_DATA_DIR: &str = "raw_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ZoneFileKind {
    SiteYaml,
    SiteImage,
    ParametersYaml,
    SourceTypeYaml,
    SourceYaml,
    GenericScript,
    SourceScript,
    GenericRaw,
    SourceRaw,
    StartState,
    WriteLock,
    Other,
}

const PATTERNS: &[(&str, ZoneFileKind)] = &[
    ("sites/*/site.yaml", ZoneFileKind::SiteYaml),
    ("sites/*/images/*.*", ZoneFileKind::SiteImage),
    ("data/parameters.yaml", ZoneFileKind::ParametersYaml),
    ("data/*/source_type.yaml", ZoneFileKind::SourceTypeYaml),
    ("data/*/*/source.yaml", ZoneFileKind::SourceYaml),
    ("data/*/raw_data/data-*.raw", ZoneFileKind::GenericRaw),
    ("data/*/*/raw_data/data-*.raw", ZoneFileKind::SourceRaw),
    (".start_state", ZoneFileKind::StartState),
    (".write_lock", ZoneFileKind::WriteLock),
];

/// Compile the pattern table; `*` never crosses a `/`.
fn compile_patterns() -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for (pattern, _) in PATTERNS {
        builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
    }
    builder.build()
}

fn zone_patterns() -> &'static GlobSet {
    static SET: OnceLock<GlobSet> = OnceLock::new();
    SET.get_or_init(|| {
        compile_patterns().unwrap_or_else(|err| {
            error!(%err, "landing-zone patterns failed to compile");
            GlobSet::empty()
        })
    })
}

impl ZoneFileKind {
    pub fn classify(rel_path: &Path) -> Self {
        let key = rel_key(rel_path);
        let matched = zone_patterns().matches(key.as_str()).into_iter().min();
        if let Some((_, kind)) = matched.and_then(|index| PATTERNS.get(index)) {
            return *kind;
        }
        if is_script_name(rel_path) {
            let depth = key.split('/').count();
            if key.starts_with("data/") && depth == 3 && !key.contains("/raw_data/") {
                return ZoneFileKind::GenericScript;
            }
            if key.starts_with("data/") && depth == 4 && !key.contains("/raw_data/") {
                return ZoneFileKind::SourceScript;
            }
        }
        ZoneFileKind::Other
    }

    pub fn is_metadata(self) -> bool {
        matches!(
            self,
            ZoneFileKind::SiteYaml
                | ZoneFileKind::ParametersYaml
                | ZoneFileKind::SourceTypeYaml
                | ZoneFileKind::SourceYaml
        )
    }

    pub fn is_script(self) -> bool {
        matches!(self, ZoneFileKind::GenericScript | ZoneFileKind::SourceScript)
    }

    pub fn is_raw(self) -> bool {
        matches!(self, ZoneFileKind::GenericRaw | ZoneFileKind::SourceRaw)
    }

    /// Position in the publish order: metadata before scripts before raw data.
    pub fn publish_rank(self) -> u8 {
        match self {
            ZoneFileKind::SiteYaml => 0,
            ZoneFileKind::SiteImage => 1,
            ZoneFileKind::ParametersYaml => 2,
            ZoneFileKind::SourceTypeYaml => 3,
            ZoneFileKind::SourceYaml => 4,
            ZoneFileKind::GenericScript | ZoneFileKind::SourceScript => 5,
            ZoneFileKind::Other | ZoneFileKind::StartState | ZoneFileKind::WriteLock => 6,
            ZoneFileKind::GenericRaw | ZoneFileKind::SourceRaw => 7,
        }
    }
}

fn is_script_name(rel_path: &Path) -> bool {
    let stem = rel_path.file_stem().and_then(|s| s.to_str());
    let ext = rel_path.extension().and_then(|s| s.to_str());
    match (stem, ext) {
        (Some(CONVERSION_STEM), Some(ext)) => SCRIPT_EXTENSIONS.contains(&ext),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct LandingZone {
    root: PathBuf,
}

impl LandingZone {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, rel_path: &Path) -> PathBuf {
        self.root.join(rel_path)
    }

    pub fn relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    /// Conversion scripts applicable to a raw file, relative to the zone root.
    ///
    /// The folder holding `raw_data/` is searched first; a source folder with no
    /// script of its own falls back to its source-type folder.
    pub fn conversion_script_candidates(&self, raw_rel: &Path) -> Vec<PathBuf> {
        let Some(owner) = raw_rel.parent().and_then(Path::parent) else {
            return Vec::new();
        };
        let found = self.scripts_in(owner);
        if !found.is_empty() {
            return found;
        }
        if ZoneFileKind::classify(raw_rel) == ZoneFileKind::SourceRaw {
            if let Some(source_type_dir) = owner.parent() {
                return self.scripts_in(source_type_dir);
            }
        }
        Vec::new()
    }

    fn scripts_in(&self, rel_dir: &Path) -> Vec<PathBuf> {
        SCRIPT_EXTENSIONS
            .iter()
            .map(|ext| rel_dir.join(format!("{CONVERSION_STEM}.{ext}")))
            .filter(|rel| self.root.join(rel).is_file())
            .collect()
    }

    /// Source name implied by a source-specific script; `None` for generic ones.
    pub fn script_source_name(script_rel: &Path) -> Option<String> {
        if ZoneFileKind::classify(script_rel) != ZoneFileKind::SourceScript {
            return None;
        }
        script_rel
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
    }

    /// Directory name that must equal the entity name of a metadata file.
    pub fn metadata_owner_name(rel_path: &Path) -> Option<String> {
        match ZoneFileKind::classify(rel_path) {
            ZoneFileKind::SiteYaml | ZoneFileKind::SourceTypeYaml | ZoneFileKind::SourceYaml => {
                rel_path
                    .parent()
                    .and_then(Path::file_name)
                    .map(|n| n.to_string_lossy().to_string())
            }
            _ => None,
        }
    }

    /// Source-type directory of a `data/<type>/<source>/source.yaml` file.
    pub fn source_type_of_source(rel_path: &Path) -> Option<String> {
        if ZoneFileKind::classify(rel_path) != ZoneFileKind::SourceYaml {
            return None;
        }
        rel_path
            .parent()
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
    }
}
