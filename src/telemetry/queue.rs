//! Durable local queue of undelivered telemetry
//!
//! One serialized body per line, appended in enqueue order. Entries leave the
//! file only as a front prefix, rewritten through a temporary file and an
//! atomic rename so a crash leaves either the old or the new queue.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::Result;

/// One queued body and its position in enqueue order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub seq: usize,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct LocalQueue {
    path: PathBuf,
}

impl LocalQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one body and flush it to disk
    pub async fn append(&self, body: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut line = String::with_capacity(body.len() + 1);
        line.push_str(body.trim_end_matches(['\r', '\n']));
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Every queued entry, oldest first. A missing file is an empty queue.
    pub async fn entries(&self) -> Result<Vec<QueueEntry>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_lines(&contents)
            .enumerate()
            .map(|(seq, body)| QueueEntry {
                seq,
                body: body.to_string(),
            })
            .collect())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop the `count` oldest entries; deletes the file once nothing is left
    pub async fn remove_front(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let remaining: Vec<&str> = parse_lines(&contents).skip(count).collect();
        if remaining.is_empty() {
            match fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            debug!("Local queue emptied");
            return Ok(());
        }

        let mut rewritten = remaining.join("\n");
        rewritten.push('\n');
        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(rewritten.as_bytes()).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, &self.path).await?;
        debug!("Local queue trimmed by {}, {} left", count, remaining.len());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn parse_lines(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
}
