use crate::util::generate_id;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use tokio::sync::Mutex;

pub const MEDIA_URL_PREFIX: &str = "/media/";

#[derive(Debug)]
pub enum MediaError {
    Unavailable,
    Io,
}

impl Display for MediaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "media storage unavailable"),
            Self::Io => write!(f, "media io failure"),
        }
    }
}

impl Error for MediaError {}

/// Attachment blob store. A failed upload fails the whole send; removal is
/// best effort because the message row is already gone by then.
pub enum MediaStore {
    Disabled,
    Directory(PathBuf),
    Memory(Mutex<HashMap<String, Vec<u8>>>),
}

impl MediaStore {
    pub fn directory(root: PathBuf) -> Self {
        Self::Directory(root)
    }

    pub fn memory() -> Self {
        Self::Memory(Mutex::new(HashMap::new()))
    }

    /// Writes the blob and returns the URL to embed in the message row.
    pub async fn store(&self, name: &str, bytes: &[u8]) -> Result<String, MediaError> {
        let file_name = format!("{}-{}", generate_id("media"), sanitize_name(name));
        let url = format!("{}{}", MEDIA_URL_PREFIX, file_name);
        match self {
            Self::Disabled => Err(MediaError::Unavailable),
            Self::Directory(root) => {
                tokio::fs::create_dir_all(root)
                    .await
                    .map_err(|_| MediaError::Io)?;
                tokio::fs::write(root.join(&file_name), bytes)
                    .await
                    .map_err(|_| MediaError::Io)?;
                Ok(url)
            }
            Self::Memory(blobs) => {
                blobs.lock().await.insert(url.clone(), bytes.to_vec());
                Ok(url)
            }
        }
    }

    pub async fn remove(&self, url: &str) -> Result<(), MediaError> {
        match self {
            Self::Disabled => Ok(()),
            Self::Directory(root) => {
                let Some(file_name) = url.strip_prefix(MEDIA_URL_PREFIX) else {
                    return Ok(());
                };
                // Stored names never contain separators; anything else is a
                // foreign URL and not ours to touch.
                if file_name.contains('/') || file_name.contains("..") {
                    return Ok(());
                }
                match tokio::fs::remove_file(root.join(file_name)).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(_) => Err(MediaError::Io),
                }
            }
            Self::Memory(blobs) => {
                blobs.lock().await.remove(url);
                Ok(())
            }
        }
    }
}

fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(64));
    for ch in name.chars() {
        if out.len() >= 64 {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push_str("blob");
    }
    out
}
