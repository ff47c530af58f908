use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

fn client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(concat!("dpu-sim/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// `<dest>.part`, where writes go before they are renamed into place.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut partial = dest.as_os_str().to_owned();
    partial.push(".part");
    PathBuf::from(partial)
}

/// Download a URL to a file on disk.
///
/// The body streams into `<dest>.part`, renamed into place once complete.
pub fn download_file(url: &str, dest: &Path) -> Result<()> {
    let mut resp = client(Duration::from_secs(3600))?
        .get(url)
        .send()
        .with_context(|| format!("Download failed: {}", url))?;

    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("HTTP {} downloading {}", status, url);
    }

    let partial = partial_path(dest);

    let mut file = std::fs::File::create(&partial)
        .with_context(|| format!("Failed to create file: {}", partial.display()))?;
    resp.copy_to(&mut file)
        .with_context(|| format!("Failed to write to: {}", partial.display()))?;
    drop(file);

    std::fs::rename(&partial, dest)
        .with_context(|| format!("Failed to move download into place: {}", dest.display()))?;
    Ok(())
}
