//! Deterministic on-disk home for one alignment's stage outputs and checkpoint.
//!
//! Layout below `<artifact_root>/<subject>/<run>/<alignment>/`, where each
//! component is an id kept verbatim when it is already a plain lowercase
//! name and otherwise suffixed with a digest of the raw id:
//!
//! ```text
//! checkpoint.json
//! outputs/<stage>.json
//! variants/pipeline.vcf.gz
//! variants/<lineage>.vcf.gz
//! scratch/
//! ```

use crate::fingerprint::to_hex;
use haplocall_protocol::{AlignmentInput, LineageType, StageId, StageOutput};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const OUTPUTS_DIR: &str = "outputs";
const VARIANTS_DIR: &str = "variants";
const SCRATCH_DIR: &str = "scratch";
const ID_DIGEST_HEX_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactNamespace {
    root: PathBuf,
}

impl ArtifactNamespace {
    pub fn for_input(artifact_root: &Path, input: &AlignmentInput) -> Self {
        Self {
            root: artifact_root
                .join(id_path_component(&input.subject_id, "subject"))
                .join(id_path_component(&input.run_id, "run"))
                .join(id_path_component(&input.alignment_id, "alignment")),
        }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> io::Result<()> {
        for dir in [OUTPUTS_DIR, VARIANTS_DIR, SCRATCH_DIR] {
            fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub fn stage_output_path(&self, stage: StageId) -> PathBuf {
        self.root
            .join(OUTPUTS_DIR)
            .join(format!("{}.json", stage.as_str()))
    }

    /// Variant file produced by the pipeline's own variant-calling stage.
    pub fn pipeline_variants_path(&self) -> PathBuf {
        self.root.join(VARIANTS_DIR).join("pipeline.vcf.gz")
    }

    /// Variant file cached by an earlier invocation of a lineage stage.
    pub fn lineage_variants_path(&self, lineage_type: LineageType) -> PathBuf {
        self.root
            .join(VARIANTS_DIR)
            .join(format!("{}.vcf.gz", lineage_type.as_str()))
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    pub fn write_stage_output(&self, output: &StageOutput) -> io::Result<()> {
        write_json_atomic(&self.stage_output_path(output.stage()), output)
    }

    /// `Ok(None)` when the stage never cached an output.
    pub fn read_stage_output(&self, stage: StageId) -> io::Result<Option<StageOutput>> {
        let path = self.stage_output_path(stage);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let output: StageOutput = serde_json::from_str(&text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if output.stage() != stage {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "'{}' holds {} output, expected {}",
                    path.display(),
                    output.stage(),
                    stage
                ),
            ));
        }
        Ok(Some(output))
    }

    pub fn remove_stage_output(&self, stage: StageId) -> io::Result<()> {
        match fs::remove_file(self.stage_output_path(stage)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Writes `<path>.part`, flushes, then renames over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = part_path(path);
    let result = (|| {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    fs::rename(&tmp_path, path)
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(path, text.as_bytes())
}

/// Copies `source` over `destination` through a `.part` file.
pub(crate) fn copy_atomic(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = part_path(destination);
    if let Err(e) = fs::copy(source, &tmp_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    fs::rename(&tmp_path, destination)
}

fn part_path(path: &Path) -> PathBuf {
    let mut tmp_os: OsString = path.as_os_str().to_os_string();
    tmp_os.push(".part");
    PathBuf::from(tmp_os)
}

pub(crate) fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

pub(crate) fn canonical_or_display(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

pub(crate) fn sanitize_for_path(s: &str, fallback: &str) -> String {
    let mut out = String::new();
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if matches!(c, ' ' | '-' | '_' | '.' | ':' | '/') && !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Readable and injective: distinct ids never share a component. Sanitized
/// names contain no `-`, so a digest-suffixed name cannot equal a verbatim one.
pub(crate) fn id_path_component(id: &str, fallback: &str) -> String {
    let sanitized = sanitize_for_path(id, fallback);
    if sanitized == id {
        return sanitized;
    }
    let digest = to_hex(&Sha1::digest(id.as_bytes()));
    format!("{sanitized}-{}", &digest[..ID_DIGEST_HEX_LEN])
}
