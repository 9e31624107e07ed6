//! Flowcharts through the mermaid CLI (`mmdc`), cached on disk by content hash.

use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Instant,
};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub(crate) enum MermaidError {
    #[error("failed to prepare diagram cache: {0}")]
    CacheInit(io::Error),
    #[error("diagram scratch file failed: {0}")]
    Io(io::Error),
    #[error("mermaid CLI exited with {exit_code:?}: {stderr}")]
    Cli {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("mermaid CLI not found: {0}")]
    NotFound(io::Error),
}

#[derive(Debug, Clone)]
pub(crate) struct MermaidRenderer {
    cli_path: PathBuf,
    cache: SvgCache,
}

impl MermaidRenderer {
    pub(crate) fn new(cli_path: PathBuf, cache_dir: PathBuf) -> Result<Self, MermaidError> {
        fs::create_dir_all(&cache_dir).map_err(MermaidError::CacheInit)?;
        Ok(Self {
            cli_path,
            cache: SvgCache { dir: cache_dir },
        })
    }

    pub(crate) fn render_svg(&self, source: &str) -> Result<String, MermaidError> {
        let started_at = Instant::now();
        let key = content_key(source);

        if let Some(svg) = self.cache.get(&key) {
            debug!(
                target = "markdownd::render::mermaid",
                key = %key,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "diagram served from cache"
            );
            return Ok(svg);
        }

        let svg = self.invoke_cli(source, &key)?;
        debug!(
            target = "markdownd::render::mermaid",
            key = %key,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            svg_bytes = svg.len(),
            "diagram rendered"
        );
        Ok(svg)
    }

    fn invoke_cli(&self, source: &str, key: &str) -> Result<String, MermaidError> {
        let mut input = NamedTempFile::new().map_err(MermaidError::Io)?;
        input
            .write_all(source.as_bytes())
            .and_then(|()| input.flush())
            .map_err(MermaidError::Io)?;

        // mmdc picks the output format from the file suffix.
        let output = tempfile::Builder::new()
            .suffix(".svg")
            .tempfile_in(&self.cache.dir)
            .map_err(MermaidError::Io)?;

        let status = Command::new(&self.cli_path)
            .arg("--input")
            .arg(input.path())
            .arg("--output")
            .arg(output.path())
            .arg("--outputFormat")
            .arg("svg")
            .arg("--quiet")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => MermaidError::NotFound(err),
                _ => MermaidError::Io(err),
            })?;

        if !status.status.success() {
            let stderr = String::from_utf8_lossy(&status.stderr).trim().to_string();
            warn!(
                target = "markdownd::render::mermaid",
                exit_code = status.status.code().map(i64::from).unwrap_or(-1),
                stderr = %stderr,
                "mermaid CLI failed"
            );
            return Err(MermaidError::Cli {
                exit_code: status.status.code(),
                stderr,
            });
        }

        self.cache.store(output, key)
    }
}

#[derive(Debug, Clone)]
struct SvgCache {
    dir: PathBuf,
}

impl SvgCache {
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.svg"))
    }

    fn get(&self, key: &str) -> Option<String> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(svg) => Some(svg),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                warn!(
                    target = "markdownd::render::mermaid",
                    path = %path.display(),
                    error = %err,
                    "unreadable cached diagram; rendering again"
                );
                None
            }
        }
    }

    fn store(&self, rendered: NamedTempFile, key: &str) -> Result<String, MermaidError> {
        let path = self.path_for(key);
        match rendered.persist(&path) {
            Ok(_) => {}
            // Another worker stored the same diagram first.
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => return Err(MermaidError::Io(err.error)),
        }
        read_svg(&path)
    }
}

fn read_svg(path: &Path) -> Result<String, MermaidError> {
    fs::read_to_string(path).map_err(MermaidError::Io)
}

fn content_key(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}
