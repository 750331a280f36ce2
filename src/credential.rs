//! Argon2id password hashing and the credential file.
//!
//! A credential is stored as a single PHC-style line:
//! ```text
//! $argon2id$v=19$m=19456,t=2,p=1$<salt>$<hash>
//! ```
//! Salt and hash are unpadded standard base64. Verification always uses the
//! version and cost parameters recorded in the line, so credentials written
//! with different tunings keep working.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::write_private;
use crate::error::{ConfigurationError, FormatError, LockError};

pub const ALGORITHM: &str = "argon2id";

const FIELD_SEPARATOR: char = '$';
// Leading separator plus five fields
const ENCODED_PARTS: usize = 6;

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

// Upper bounds for stored cost parameters. Anything above is a damaged line
// that would stall or exhaust memory during unlock.
const MAX_MEMORY_KIB: u32 = 1024 * 1024;
const MAX_ITERATIONS: u32 = 64;
const MAX_PARALLELISM: u32 = 16;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl CostParams {
    /// OWASP 2025 minimum recommendation for Argon2id: 19 MiB, 2 passes, 1 lane.
    pub const DEFAULT: CostParams = CostParams {
        memory_kib: 19 * 1024,
        iterations: 2,
        parallelism: 1,
    };

    fn encode(&self) -> String {
        format!(
            "m={},t={},p={}",
            self.memory_kib, self.iterations, self.parallelism
        )
    }

    fn parse(field: &str) -> Result<Self, FormatError> {
        let bad = || FormatError::Params(field.to_string());

        let (mut memory, mut iterations, mut parallelism) = (None, None, None);
        for pair in field.split(',') {
            let (key, value) = pair.split_once('=').ok_or_else(bad)?;
            let value: u32 = value.parse().map_err(|_| bad())?;
            let slot = match key {
                "m" => &mut memory,
                "t" => &mut iterations,
                "p" => &mut parallelism,
                _ => return Err(bad()),
            };
            if slot.replace(value).is_some() {
                return Err(bad());
            }
        }

        let cost = CostParams {
            memory_kib: memory.ok_or_else(bad)?,
            iterations: iterations.ok_or_else(bad)?,
            parallelism: parallelism.ok_or_else(bad)?,
        };
        if !cost.within_limits() {
            return Err(bad());
        }
        Ok(cost)
    }

    fn within_limits(&self) -> bool {
        self.memory_kib <= MAX_MEMORY_KIB
            && self.iterations <= MAX_ITERATIONS
            && self.parallelism <= MAX_PARALLELISM
    }

    fn to_argon2(self, output_len: usize) -> Result<Params, FormatError> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(output_len),
        )
        .map_err(|e| FormatError::Params(format!("{} ({})", self.encode(), e)))
    }
}

impl Default for CostParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Hash a password with a fresh random salt and the default cost parameters.
pub fn hash_password(password: &[u8]) -> Result<String, LockError> {
    hash_password_with(password, CostParams::DEFAULT)
}

/// Hash a password with a fresh random salt and explicit cost parameters.
pub fn hash_password_with(password: &[u8], cost: CostParams) -> Result<String, LockError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| LockError::Verification(format!("generating salt: {}", e)))?;

    let params = cost.to_argon2(KEY_LEN)?;
    let hash = derive(password, &salt, Version::V0x13, params)?;

    Ok(format!(
        "{sep}{alg}{sep}v={ver}{sep}{cost}{sep}{salt}{sep}{hash}",
        sep = FIELD_SEPARATOR,
        alg = ALGORITHM,
        ver = Version::V0x13 as u32,
        cost = cost.encode(),
        salt = STANDARD_NO_PAD.encode(salt),
        hash = STANDARD_NO_PAD.encode(hash.as_slice()),
    ))
}

/// Check a password against an encoded credential.
///
/// Returns `Ok(false)` on mismatch; a malformed encoding is a
/// [`FormatError`], never a panic.
pub fn verify_password(password: &[u8], encoded: &str) -> Result<bool, LockError> {
    let stored = EncodedHash::parse(encoded)?;
    let params = stored.cost.to_argon2(stored.hash.len())?;
    let computed = derive(password, &stored.salt, stored.version, params)?;

    Ok(computed.as_slice().ct_eq(stored.hash.as_slice()).into())
}

fn derive(
    password: &[u8],
    salt: &[u8],
    version: Version,
    params: Params,
) -> Result<Zeroizing<Vec<u8>>, LockError> {
    let mut out = Zeroizing::new(vec![0u8; params.output_len().unwrap_or(KEY_LEN)]);
    Argon2::new(Algorithm::Argon2id, version, params)
        .hash_password_into(password, salt, out.as_mut_slice())
        .map_err(|e| LockError::Verification(e.to_string()))?;
    Ok(out)
}

struct EncodedHash {
    version: Version,
    cost: CostParams,
    salt: Vec<u8>,
    hash: Zeroizing<Vec<u8>>,
}

impl EncodedHash {
    fn parse(encoded: &str) -> Result<Self, FormatError> {
        let parts: Vec<&str> = encoded.split(FIELD_SEPARATOR).collect();
        if parts.len() != ENCODED_PARTS || !parts[0].is_empty() {
            let fields = if parts[0].is_empty() {
                parts.len() - 1
            } else {
                parts.len()
            };
            return Err(FormatError::FieldCount(fields));
        }

        if parts[1] != ALGORITHM {
            return Err(FormatError::Algorithm(parts[1].to_string()));
        }

        let version = match parts[2].strip_prefix("v=").map(str::parse::<u32>) {
            Some(Ok(0x13)) => Version::V0x13,
            Some(Ok(0x10)) => Version::V0x10,
            _ => return Err(FormatError::Version(parts[2].to_string())),
        };

        let cost = CostParams::parse(parts[3])?;

        let salt = STANDARD_NO_PAD
            .decode(parts[4])
            .map_err(FormatError::Salt)?;
        let hash = Zeroizing::new(
            STANDARD_NO_PAD
                .decode(parts[5])
                .map_err(FormatError::Hash)?,
        );

        Ok(Self {
            version,
            cost,
            salt,
            hash,
        })
    }
}

/// Reject an unusable new password before it is stored.
pub fn validate_new_password(
    password: &[u8],
    confirmation: &[u8],
) -> Result<(), ConfigurationError> {
    if password.is_empty() {
        return Err(ConfigurationError::EmptyPassword);
    }
    if !bool::from(password.ct_eq(confirmation)) {
        return Err(ConfigurationError::PasswordMismatch);
    }
    Ok(())
}

/// The credential file: one encoded hash line, owner read/write only.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store an already encoded credential, replacing any previous one.
    pub fn save(&self, encoded: &str) -> Result<(), LockError> {
        let line = format!("{}\n", encoded);
        write_private(&self.path, line.as_bytes(), "password file")?;
        log::info!("Stored password hash in {}", self.path.display());
        Ok(())
    }

    /// Read the encoded credential.
    pub fn load(&self) -> Result<String, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(data) => Ok(data.trim().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ConfigurationError::NoPassword.into())
            }
            Err(e) => Err(LockError::storage("reading password file")(e)),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Delete the stored credential. Removing a missing credential succeeds.
    pub fn remove(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::info!("Removed password file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::storage("removing password file")(e)),
        }
    }

    /// Hash and store a new password.
    pub fn set_password(&self, password: &[u8]) -> Result<(), LockError> {
        let encoded = hash_password(password)?;
        self.save(&encoded)
    }

    /// Verify a password against the stored credential.
    pub fn check(&self, password: &[u8]) -> Result<bool, LockError> {
        let encoded = self.load()?;
        verify_password(password, &encoded)
    }
}
