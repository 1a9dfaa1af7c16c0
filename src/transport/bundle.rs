//! Bundled test files travel inside the RUN message as zlib-compressed,
//! base64-encoded strings keyed by relative path.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde_json::{Map, Value};

use crate::error::{AgentError, AppError, AppResult};

/// # Errors
///
/// Returns an error when compression fails.
pub fn pack_files(files: &[(String, Vec<u8>)]) -> AppResult<Map<String, Value>> {
    let mut packed = Map::new();
    for (name, contents) in files {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(contents)?;
        let compressed = encoder.finish()?;
        packed.insert(name.clone(), Value::String(BASE64.encode(compressed)));
    }
    Ok(packed)
}

/// # Errors
///
/// Returns an error when the payload is not valid base64 or zlib data.
pub fn unpack_file(name: &str, payload: &str) -> AppResult<Vec<u8>> {
    let compressed = BASE64.decode(payload).map_err(|err| {
        AppError::agent(AgentError::BadFilePayload {
            name: name.to_owned(),
            message: err.to_string(),
        })
    })?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut contents = Vec::new();
    decoder.read_to_end(&mut contents).map_err(|err| {
        AppError::agent(AgentError::BadFilePayload {
            name: name.to_owned(),
            message: err.to_string(),
        })
    })?;
    Ok(contents)
}
