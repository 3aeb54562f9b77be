//! Digest command - print the content digest of a document

use crate::cli::args::{DigestArgs, InputFormat};
use crate::digest::{digest, ContentDigest, Value};
use crate::error::{CorralError, CorralResult};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Execute the digest command
pub async fn execute(args: DigestArgs) -> CorralResult<()> {
    let content = match args.file {
        Some(ref path) => read_file(path).await?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .map_err(|e| CorralError::io("reading stdin", e))?;
            buf
        }
    };

    let format = match (args.format, args.file.as_deref()) {
        (InputFormat::Auto, Some(path))
            if path.extension().is_some_and(|ext| ext == "toml") =>
        {
            InputFormat::Toml
        }
        (format, _) => format,
    };

    let sum = digest_document(&content, format)?;
    if args.short {
        println!("{}", sum.short());
    } else {
        println!("{}", sum);
    }
    Ok(())
}

async fn read_file(path: &Path) -> CorralResult<String> {
    if !path.exists() {
        return Err(CorralError::PathNotFound(path.to_path_buf()));
    }
    fs::read_to_string(path)
        .await
        .map_err(|e| CorralError::io(format!("reading {}", path.display()), e))
}

/// Parse `content` as `format` and digest the resulting value
pub fn digest_document(content: &str, format: InputFormat) -> CorralResult<ContentDigest> {
    let value = match format {
        InputFormat::Json => Value::from(serde_json::from_str::<serde_json::Value>(content)?),
        InputFormat::Toml => Value::try_from(toml::from_str::<toml::Value>(content)?)?,
        InputFormat::Auto => match serde_json::from_str::<serde_json::Value>(content) {
            Ok(json) => Value::from(json),
            Err(_) => Value::try_from(toml::from_str::<toml::Value>(content)?)?,
        },
    };
    digest(&value)
}
