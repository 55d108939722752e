use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use flate2::{read::GzDecoder, write::GzEncoder};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ToolkitError;

/// On-disk compression of array files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Plain JSON.
    #[default]
    None,
    /// Gzip-compressed JSON.
    Gzip,
}

impl Compression {
    /// Gzip for paths ending in `.gz`, plain otherwise.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("gz") => Self::Gzip,
            _ => Self::None,
        }
    }
}

/// Serializes `value` to `path`.
pub fn dump_array<T>(
    value: &T,
    path: impl AsRef<Path>,
    compression: Compression,
) -> Result<(), ToolkitError>
where
    T: Serialize + ?Sized,
{
    let path = path.as_ref();
    let file = File::create(path)
        .map_err(|err| ToolkitError::io(format!("creating {}", path.display()), err))?;
    let serde_err = |source| ToolkitError::Serde {
        path: path.to_path_buf(),
        source,
    };
    let io_err = |err| ToolkitError::io(format!("writing {}", path.display()), err);
    match compression {
        Compression::None => {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, value).map_err(serde_err)?;
            writer.flush().map_err(io_err)
        }
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(BufWriter::new(file), flate2::Compression::default());
            serde_json::to_writer(&mut encoder, value).map_err(serde_err)?;
            encoder.finish().map_err(io_err)?.flush().map_err(io_err)
        }
    }
}

/// Reads a value previously written with [`dump_array`].
pub fn load_array<T>(path: impl AsRef<Path>, compression: Compression) -> Result<T, ToolkitError>
where
    T: DeserializeOwned,
{
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|err| ToolkitError::io(format!("opening {}", path.display()), err))?;
    let reader = BufReader::new(file);
    let decoded = match compression {
        Compression::None => serde_json::from_reader(reader),
        Compression::Gzip => serde_json::from_reader(GzDecoder::new(reader)),
    };
    decoded.map_err(|source| ToolkitError::Serde {
        path: path.to_path_buf(),
        source,
    })
}
