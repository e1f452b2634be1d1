use std::{
    fs::{create_dir_all, rename, File},
    io::Write,
    path::{Path, PathBuf},
};

use burn::data::network::downloader;

/// Download the pre-trained weights to the local cache directory.
pub(crate) fn download(module: &'static str, url: &str) -> Result<PathBuf, std::io::Error> {
    // Model cache directory
    let model_dir = dirs::home_dir()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine the home directory.",
            )
        })?
        .join(".cache")
        .join(format!("{}-burn", module));

    if !model_dir.exists() {
        create_dir_all(&model_dir)?;
    }

    let file_base_name = url.rsplit_once('/').map_or(url, |(_, name)| name);
    let file_name = model_dir.join(file_base_name);
    if file_name.exists() {
        log::debug!("Using cached weights at {}", file_name.display());
    } else {
        log::info!("Downloading {url} into {}", model_dir.display());

        // Download file content
        let bytes = downloader::download_file_as_bytes(url, file_base_name);

        persist(&file_name, &bytes)?;
    }

    Ok(file_name)
}

/// Write `bytes` to a `.part` sibling of `path`, renamed into place once complete.
fn persist(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let partial = path.with_extension("part");

    let mut output_file = File::create(&partial)?;
    output_file.write_all(bytes)?;
    output_file.sync_all()?;

    rename(&partial, path)
}
