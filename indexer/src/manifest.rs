use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "bookkeeping.json";

/// Reads a JSON object mapping corpus-relative document paths to source URLs.
pub fn load_manifest(path: &Path) -> Result<HashMap<String, String>> {
    let f = File::open(path).with_context(|| format!("opening manifest {}", path.display()))?;
    let manifest: HashMap<String, String> =
        serde_json::from_reader(BufReader::new(f)).with_context(|| format!("parsing manifest {}", path.display()))?;
    tracing::info!(documents = manifest.len(), manifest = %path.display(), "loaded manifest");
    Ok(manifest)
}

/// Builds a manifest by walking the corpus when no bookkeeping file exists.
/// URLs fall back to `file://` locations.
pub fn manifest_from_corpus(root: &Path) -> Result<HashMap<String, String>> {
    let mut manifest = HashMap::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        let p = entry.path();
        if !p.is_file() || p.file_name().and_then(|s| s.to_str()) == Some(MANIFEST_FILE) {
            continue;
        }
        let rel = p.strip_prefix(root).with_context(|| format!("{} is outside {}", p.display(), root.display()))?;
        let key = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
        let url = format!("file://{}", p.canonicalize().unwrap_or_else(|_| p.to_path_buf()).display());
        manifest.insert(key, url);
    }
    tracing::info!(documents = manifest.len(), corpus = %root.display(), "built manifest from corpus");
    Ok(manifest)
}

/// `bookkeeping.json` inside the corpus if present, otherwise a walk of the corpus.
pub fn resolve_manifest(explicit: Option<&Path>, corpus: &Path) -> Result<HashMap<String, String>> {
    match explicit {
        Some(path) => load_manifest(path),
        None => {
            let default = corpus.join(MANIFEST_FILE);
            if default.is_file() { load_manifest(&default) } else { manifest_from_corpus(corpus) }
        }
    }
}
