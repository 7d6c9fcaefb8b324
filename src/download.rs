use crate::access::StorageAccess;
use crate::descriptor::ConnectionDescriptor;
use crate::utils::file_name;
use anyhow::Result;
use futures::stream::{self, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const BUFFER_SIZE: usize = 64 * 1024;

pub struct ParallelDownloader {
    access: Arc<StorageAccess>,
    descriptor: ConnectionDescriptor,
    max_concurrent: usize,
}

impl ParallelDownloader {
    pub fn new(access: Arc<StorageAccess>, descriptor: ConnectionDescriptor, max_concurrent: usize) -> Self {
        Self {
            access,
            descriptor,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn download_files(
        &self,
        files: Vec<(String, PathBuf)>, // (remote_path, local_path)
    ) -> Vec<Result<u64>> {
        let multi_progress = MultiProgress::new();

        stream::iter(files)
            .map(|(remote_path, local_path)| {
                let pb = multi_progress.add(ProgressBar::new(0));
                async move { self.download_single_file(&remote_path, &local_path, pb).await }
            })
            .buffer_unordered(self.max_concurrent)
            .collect::<Vec<_>>()
            .await
    }

    async fn download_single_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        progress_bar: ProgressBar,
    ) -> Result<u64> {
        progress_bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")?
                .progress_chars("#>-"),
        );

        let name = file_name(remote_path);
        progress_bar.set_message(format!("Downloading {}", name));

        let entry = self.access.stat_file(&self.descriptor, remote_path).await?;
        progress_bar.set_length(entry.size.unwrap_or(0));

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut input = self.access.open_input_stream(&self.descriptor, remote_path).await?;
        let mut output = tokio::fs::File::create(local_path).await?;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = input.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            output.write_all(&buffer[..n]).await?;
            total += n as u64;
            progress_bar.set_position(total);
        }
        output.flush().await?;

        progress_bar.finish_with_message(format!("✓ {}", name));
        Ok(total)
    }

    pub async fn download_directory(&self, remote_dir: &str, local_dir: &Path) -> Result<Vec<Result<u64>>> {
        let listing = self.access.list_children(&self.descriptor, remote_dir).await?;

        let download_list: Vec<(String, PathBuf)> = listing
            .iter()
            .filter(|f| !f.is_directory)
            .map(|f| (f.path.clone(), local_dir.join(&f.name)))
            .collect();

        Ok(self.download_files(download_list).await)
    }
}
