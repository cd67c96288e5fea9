//! Executable lookup and PE32+ detection.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::SystemError;
use crate::outcome::{Outcome, StatusCode};

const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const PE32_PLUS_MAGIC: u16 = 0x20B;
const E_LFANEW_OFFSET: u64 = 0x3C;
/// COFF file header size; the optional header follows it.
const COFF_HEADER_LEN: u64 = 20;

/// Resolve `file` to an existing path: absolute paths as given, bare names
/// through `PATH`.
pub fn resolve(file: &Path) -> Result<Option<PathBuf>, SystemError> {
    if file.is_absolute() {
        return match fs::symlink_metadata(file) {
            Ok(_) => Ok(Some(file.to_path_buf())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        };
    }
    let Some(search) = std::env::var_os("PATH") else {
        return Ok(None);
    };
    Ok(std::env::split_paths(&search)
        .map(|dir| dir.join(file))
        .find(|candidate| candidate.is_file()))
}

/// Whether `file` resolves to a regular (non-link) file.
pub fn can_execute(file: &Path) -> Outcome<bool> {
    let resolved = match resolve(file) {
        Ok(Some(path)) => path,
        Ok(None) => {
            return Outcome::fail(
                StatusCode::ExecuteNotFound,
                format!("{} was not found", file.display()),
            )
        }
        Err(err) => return Outcome::fail(StatusCode::ExecuteError, err.to_string()),
    };

    match fs::symlink_metadata(&resolved) {
        Ok(meta) if meta.file_type().is_symlink() => Outcome::fail(
            StatusCode::ExecuteCanNotExecute,
            format!("{} is a link, not an executable file", resolved.display()),
        ),
        Ok(meta) if !meta.is_file() => Outcome::fail(
            StatusCode::ExecuteCanNotExecute,
            format!("{} is not a file", resolved.display()),
        ),
        Ok(_) => Outcome::ok(true),
        Err(err) => Outcome::fail(StatusCode::ExecuteError, SystemError::from(err).to_string()),
    }
}

/// Whether `file` is a PE32+ (64-bit) image.
pub fn is_64bit(file: &Path) -> Outcome<bool> {
    match read_pe_magic(file) {
        Ok(PE32_PLUS_MAGIC) => Outcome::ok(true),
        Ok(magic) => Outcome::fail(
            StatusCode::Is64BitNot64,
            format!("{} is not a 64-bit image (magic {magic:#x})", file.display()),
        ),
        Err(err) => Outcome::fail(
            StatusCode::Is64BitError,
            format!("{}: {err}", file.display()),
        ),
    }
}

fn read_pe_magic(file: &Path) -> io::Result<u16> {
    let mut f = File::open(file)?;
    let mut mz = [0u8; 2];
    f.read_exact(&mut mz)?;
    if &mz != b"MZ" {
        return Err(invalid("missing MZ header"));
    }

    f.seek(SeekFrom::Start(E_LFANEW_OFFSET))?;
    let mut lfanew = [0u8; 4];
    f.read_exact(&mut lfanew)?;
    let pe_offset = u64::from(u32::from_le_bytes(lfanew));

    f.seek(SeekFrom::Start(pe_offset))?;
    let mut signature = [0u8; 4];
    f.read_exact(&mut signature)?;
    if &signature != PE_SIGNATURE {
        return Err(invalid("missing PE signature"));
    }

    f.seek(SeekFrom::Start(pe_offset + 4 + COFF_HEADER_LEN))?;
    let mut magic = [0u8; 2];
    f.read_exact(&mut magic)?;
    Ok(u16::from_le_bytes(magic))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
