//! Reference genome resolution.
//!
//! The coordinator only needs a path to an indexed FASTA for a named build.
//! `ReferenceCatalog` prepares that path once per cache directory from a
//! local or remote source and reuses it afterwards.

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::namespace::{canonical_or_display, sanitize_for_path, write_json_atomic};
use anyhow::{Context, Result, anyhow, bail};
use flate2::read::GzDecoder;
use haplocall_protocol::now_unix_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const MANIFEST_FILE: &str = "manifest.json";
const FASTA_FILE: &str = "reference.fa";
const FASTA_INDEX_FILE: &str = "reference.fa.fai";

/// Resolves a genome build name to a usable reference FASTA.
pub trait ReferenceResolver: Send + Sync {
    fn resolve(
        &self,
        build: &str,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<PathBuf>;
}

/// Fixed build-to-path table for references that are already on disk.
#[derive(Debug, Clone, Default)]
pub struct StaticReferences {
    paths: HashMap<String, PathBuf>,
}

impl StaticReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build(mut self, build: &str, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(build.to_string(), path.into());
        self
    }
}

impl ReferenceResolver for StaticReferences {
    fn resolve(
        &self,
        build: &str,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<PathBuf> {
        let path = self
            .paths
            .get(build)
            .ok_or_else(|| anyhow!("Reference build '{build}' is not configured"))?;
        let size = fs::metadata(path)
            .with_context(|| format!("Reference file '{}' is not readable", path.display()))?
            .len();
        on_progress(size, Some(size));
        Ok(path.clone())
    }
}

/// The resolver `config` asks for: its explicit FASTA, else its catalog.
/// With neither, every build is unknown and runs fail their precondition.
pub fn resolver_from_config(
    config: &PipelineConfig,
) -> Result<Arc<dyn ReferenceResolver>, ConfigError> {
    if let Some(fasta) = &config.reference_fasta {
        return Ok(Arc::new(
            StaticReferences::new().with_build(&config.reference_build, fasta),
        ));
    }
    match &config.reference_catalog {
        Some(path) => {
            let catalog = ReferenceCatalog::from_json_file(path, &config.reference_cache_dir)
                .map_err(|e| ConfigError::ReferenceCatalog {
                    path: path.clone(),
                    cause: format!("{e:#}"),
                })?;
            Ok(Arc::new(catalog))
        }
        None => Ok(Arc::new(StaticReferences::new())),
    }
}

/// Catalog entry describing where to fetch one reference build.
#[derive(Default, Deserialize, Serialize, Debug, Clone)]
pub struct ReferenceCatalogEntry {
    pub description: Option<String>,
    pub fasta_local: Option<String>,
    pub fasta_remote: Option<String>,
    pub cache_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReferenceInstallManifest {
    build: String,
    source: String,
    fasta_path: String,
    fasta_index_path: String,
    contig_count: usize,
    total_bases: u64,
    installed_at_unix_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedReference {
    pub build: String,
    pub reused_existing: bool,
    pub fasta_path: String,
    pub fasta_index_path: String,
    pub contig_count: usize,
    pub total_bases: u64,
}

#[derive(Debug, Clone)]
pub struct ReferenceCatalog {
    entries: HashMap<String, ReferenceCatalogEntry>,
    catalog_base_dir: PathBuf,
    default_cache_dir: PathBuf,
}

impl ReferenceCatalog {
    pub fn from_json_file(path: &Path, default_cache_dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read reference catalog '{}'", path.display()))?;
        let entries: HashMap<String, ReferenceCatalogEntry> = serde_json::from_str(&text)
            .with_context(|| format!("Could not parse reference catalog '{}'", path.display()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            entries,
            catalog_base_dir: base,
            default_cache_dir: default_cache_dir.to_path_buf(),
        })
    }

    pub fn list_builds(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn is_prepared(&self, build: &str) -> Result<bool> {
        let manifest_path = self.install_dir(build, self.entry(build)?).join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Ok(false);
        }
        let manifest = load_manifest(&manifest_path)?;
        Ok(validate_manifest_files(&manifest).is_ok())
    }

    /// Materialises and indexes the build's FASTA unless a valid install
    /// manifest already exists.
    pub fn prepare_once(
        &self,
        build: &str,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<PreparedReference> {
        let entry = self.entry(build)?;
        let install_dir = self.install_dir(build, entry);
        fs::create_dir_all(&install_dir).with_context(|| {
            format!(
                "Could not create reference cache dir '{}'",
                install_dir.display()
            )
        })?;
        let manifest_path = install_dir.join(MANIFEST_FILE);

        if manifest_path.exists() {
            let manifest = load_manifest(&manifest_path)?;
            validate_manifest_files(&manifest)?;
            debug!(build, path = %manifest.fasta_path, "reusing prepared reference");
            on_progress(1, Some(1));
            return Ok(manifest.into_report(true));
        }

        let source = self.resolve_source(build, entry)?;
        let fasta_path = install_dir.join(FASTA_FILE);
        let fasta_index_path = install_dir.join(FASTA_INDEX_FILE);
        info!(build, %source, "preparing reference genome");

        // download and index each take half of the reported byte range
        materialize_source_with_progress(&source, &fasta_path, |done, total| match total {
            Some(t) => on_progress(done, Some(t.saturating_mul(2))),
            None => on_progress(done, None),
        })?;
        let summary = build_fasta_index_with_progress(&fasta_path, &fasta_index_path, |done, total| {
            if let Some(t) = total {
                on_progress(t.saturating_add(done), Some(t.saturating_mul(2)));
            }
        })?;

        let manifest = ReferenceInstallManifest {
            build: build.to_string(),
            source,
            fasta_path: canonical_or_display(&fasta_path),
            fasta_index_path: canonical_or_display(&fasta_index_path),
            contig_count: summary.contig_count,
            total_bases: summary.total_bases,
            installed_at_unix_ms: now_unix_ms(),
        };
        write_json_atomic(&manifest_path, &manifest).with_context(|| {
            format!(
                "Could not write reference manifest '{}'",
                manifest_path.display()
            )
        })?;
        Ok(manifest.into_report(false))
    }

    fn entry(&self, build: &str) -> Result<&ReferenceCatalogEntry> {
        self.entries
            .get(build)
            .ok_or_else(|| anyhow!("Reference build '{build}' is not present in the catalog"))
    }

    fn install_dir(&self, build: &str, entry: &ReferenceCatalogEntry) -> PathBuf {
        let base = entry
            .cache_dir
            .as_ref()
            .map(|raw| self.resolve_local_path(raw))
            .unwrap_or_else(|| self.default_cache_dir.clone());
        base.join(sanitize_for_path(build, "reference"))
    }

    fn resolve_source(&self, build: &str, entry: &ReferenceCatalogEntry) -> Result<String> {
        if let Some(local_raw) = &entry.fasta_local {
            let local_path = self.resolve_local_path(local_raw);
            if local_path.exists() {
                return Ok(canonical_or_display(&local_path));
            }
            if entry.fasta_remote.is_none() {
                bail!(
                    "Reference build '{build}' has a fasta_local path '{}', but that file does not exist",
                    local_path.display()
                );
            }
        }
        entry.fasta_remote.clone().ok_or_else(|| {
            anyhow!("Reference build '{build}' does not provide fasta_local or fasta_remote source")
        })
    }

    fn resolve_local_path(&self, raw: &str) -> PathBuf {
        if let Some(stripped) = raw.strip_prefix("file://") {
            return PathBuf::from(stripped);
        }
        let p = Path::new(raw);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.catalog_base_dir.join(p)
        }
    }
}

impl ReferenceResolver for ReferenceCatalog {
    fn resolve(
        &self,
        build: &str,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<PathBuf> {
        let prepared = self.prepare_once(build, on_progress)?;
        Ok(PathBuf::from(prepared.fasta_path))
    }
}

impl ReferenceInstallManifest {
    fn into_report(self, reused_existing: bool) -> PreparedReference {
        PreparedReference {
            build: self.build,
            reused_existing,
            fasta_path: self.fasta_path,
            fasta_index_path: self.fasta_index_path,
            contig_count: self.contig_count,
            total_bases: self.total_bases,
        }
    }
}

fn load_manifest(path: &Path) -> Result<ReferenceInstallManifest> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Could not read reference manifest '{}'", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Could not parse reference manifest '{}'", path.display()))
}

fn validate_manifest_files(manifest: &ReferenceInstallManifest) -> Result<()> {
    for path in [&manifest.fasta_path, &manifest.fasta_index_path] {
        if !Path::new(path).exists() {
            bail!("Reference installation is incomplete; missing file '{path}'");
        }
    }
    Ok(())
}

fn is_http_source(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn is_gzip_source(source: &str) -> bool {
    source.to_ascii_lowercase().ends_with(".gz")
}

struct SourceReader {
    reader: Box<dyn Read>,
    total_bytes: Option<u64>,
}

fn open_source_reader(source: &str) -> Result<SourceReader> {
    if is_http_source(source) {
        let response = reqwest::blocking::get(source)
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Could not fetch '{source}'"))?;
        let total_bytes = response.content_length();
        return Ok(SourceReader {
            reader: Box::new(response),
            total_bytes,
        });
    }
    let path = source
        .strip_prefix("file://")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(source));
    let file = File::open(&path)
        .with_context(|| format!("Could not open source file '{}'", path.display()))?;
    let total_bytes = file.metadata().ok().map(|m| m.len());
    Ok(SourceReader {
        reader: Box::new(file),
        total_bytes,
    })
}

/// Counts compressed bytes as they are pulled through a decoder.
struct ProgressReader<R, F> {
    inner: R,
    callback: F,
    bytes_done: u64,
}

impl<R, F> ProgressReader<R, F> {
    fn new(inner: R, callback: F) -> Self {
        Self {
            inner,
            callback,
            bytes_done: 0,
        }
    }
}

impl<R: Read, F: FnMut(u64)> Read for ProgressReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_done += n as u64;
        (self.callback)(self.bytes_done);
        Ok(n)
    }
}

fn materialize_source_with_progress<F>(
    source: &str,
    destination: &Path,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(u64, Option<u64>),
{
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "Could not create destination directory '{}'",
                parent.display()
            )
        })?;
    }
    let mut tmp_os: OsString = destination.as_os_str().to_os_string();
    tmp_os.push(".part");
    let tmp_path = PathBuf::from(tmp_os);

    let SourceReader {
        reader,
        total_bytes,
    } = open_source_reader(source)?;
    on_progress(0, total_bytes);
    let mut writer = BufWriter::new(
        File::create(&tmp_path)
            .with_context(|| format!("Could not create '{}'", tmp_path.display()))?,
    );

    let progress_reader = ProgressReader::new(reader, |done| on_progress(done, total_bytes));
    let copy_result = if is_gzip_source(source) {
        io::copy(&mut GzDecoder::new(progress_reader), &mut writer)
            .with_context(|| format!("Could not decompress '{source}'"))
    } else {
        let mut progress_reader = progress_reader;
        io::copy(&mut progress_reader, &mut writer)
            .with_context(|| format!("Could not copy '{source}'"))
    }
    .and_then(|_| {
        writer
            .flush()
            .with_context(|| format!("Could not flush '{}'", tmp_path.display()))
    });
    drop(writer);

    if let Err(e) = copy_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    if let Some(total) = total_bytes {
        on_progress(total, Some(total));
    }
    fs::rename(&tmp_path, destination).with_context(|| {
        format!(
            "Could not finalize destination '{}'",
            destination.display()
        )
    })
}

struct FastaIndexEntry {
    name: String,
    length: u64,
    offset: u64,
    line_bases: u64,
    line_bytes: u64,
    saw_short_line: bool,
}

struct FastaIndexSummary {
    contig_count: usize,
    total_bases: u64,
}

/// Writes a samtools-compatible `.fai` for `fasta_path`.
fn build_fasta_index_with_progress<F>(
    fasta_path: &Path,
    index_path: &Path,
    mut on_progress: F,
) -> Result<FastaIndexSummary>
where
    F: FnMut(u64, Option<u64>),
{
    let total_bytes = fs::metadata(fasta_path).ok().map(|m| m.len());
    let file = File::open(fasta_path)
        .with_context(|| format!("Could not open FASTA '{}'", fasta_path.display()))?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut byte_offset: u64 = 0;
    let mut entries: Vec<FastaIndexEntry> = Vec::new();
    let mut active: Option<FastaIndexEntry> = None;
    on_progress(0, total_bytes);

    let finish = |entry: FastaIndexEntry, entries: &mut Vec<FastaIndexEntry>| -> Result<()> {
        if entry.length == 0 {
            bail!(
                "FASTA '{}' has empty sequence record '{}'",
                fasta_path.display(),
                entry.name
            );
        }
        entries.push(entry);
        Ok(())
    };

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .with_context(|| format!("Could not read FASTA '{}'", fasta_path.display()))?;
        if bytes_read == 0 {
            break;
        }
        let stripped = line.trim_end_matches(&['\n', '\r'][..]);

        if let Some(header) = stripped.strip_prefix('>') {
            if let Some(entry) = active.take() {
                finish(entry, &mut entries)?;
            }
            let name = header.split_whitespace().next().ok_or_else(|| {
                anyhow!("FASTA '{}' has malformed header line", fasta_path.display())
            })?;
            active = Some(FastaIndexEntry {
                name: name.to_string(),
                length: 0,
                offset: 0,
                line_bases: 0,
                line_bytes: 0,
                saw_short_line: false,
            });
        } else if !stripped.is_empty() {
            let seq_bases = stripped.len() as u64;
            let Some(entry) = active.as_mut() else {
                bail!(
                    "FASTA '{}' contains sequence data before first header",
                    fasta_path.display()
                );
            };
            if entry.line_bases == 0 {
                entry.offset = byte_offset;
                entry.line_bases = seq_bases;
                entry.line_bytes = bytes_read as u64;
            } else {
                if seq_bases > entry.line_bases {
                    bail!(
                        "FASTA '{}' has inconsistent line length; line longer than first line",
                        fasta_path.display()
                    );
                }
                if entry.saw_short_line {
                    bail!(
                        "FASTA '{}' has inconsistent line length after a short line",
                        fasta_path.display()
                    );
                }
                if seq_bases < entry.line_bases {
                    entry.saw_short_line = true;
                }
            }
            entry.length += seq_bases;
        }
        byte_offset += bytes_read as u64;
        on_progress(byte_offset, total_bytes);
    }

    if let Some(entry) = active {
        finish(entry, &mut entries)?;
    }
    if entries.is_empty() {
        bail!(
            "FASTA '{}' does not contain any sequence records",
            fasta_path.display()
        );
    }

    let mut text = String::new();
    for entry in &entries {
        text.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            entry.name, entry.length, entry.offset, entry.line_bases, entry.line_bytes
        ));
    }
    crate::namespace::write_atomic(index_path, text.as_bytes())
        .with_context(|| format!("Could not write FASTA index '{}'", index_path.display()))?;
    on_progress(total_bytes.unwrap_or(byte_offset), total_bytes);
    Ok(FastaIndexSummary {
        contig_count: entries.len(),
        total_bases: entries.iter().map(|e| e.length).sum(),
    })
}
