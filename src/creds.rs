// creds.rs

use crate::*;

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SSID_MAX_LEN: usize = 32;
pub const PASSWORD_MAX_LEN: usize = 64;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Station configuration record shared between the credential-update
/// handler (writer) and the coordinator (reader).
///
/// Fixed-size and NUL padded like the radio's own record, so a shorter value
/// never leaves stale bytes from a longer previous one behind.
#[derive(Clone, PartialEq, Eq)]
pub struct StationConfig {
    ssid: [u8; SSID_MAX_LEN],
    password: [u8; PASSWORD_MAX_LEN],
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            ssid: [0; SSID_MAX_LEN],
            password: [0; PASSWORD_MAX_LEN],
        }
    }
}

impl fmt::Debug for StationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StationConfig")
            .field("ssid", &self.ssid())
            .field("password", &"***")
            .finish()
    }
}

impl StationConfig {
    pub fn clear(&mut self) {
        self.ssid.fill(0);
        self.password.fill(0);
    }

    /// Zero the whole record, then copy in whatever was supplied.
    /// Values longer than the field are cut at a char boundary.
    pub fn overwrite(&mut self, ssid: Option<&str>, password: Option<&str>) {
        self.clear();
        if let Some(s) = ssid {
            copy_truncated(&mut self.ssid, s);
        }
        if let Some(p) = password {
            copy_truncated(&mut self.password, p);
        }
    }

    pub fn ssid(&self) -> &str {
        nul_terminated(&self.ssid)
    }

    pub fn password(&self) -> &str {
        nul_terminated(&self.password)
    }

    pub fn raw_password(&self) -> &[u8; PASSWORD_MAX_LEN] {
        &self.password
    }

    pub fn is_configured(&self) -> bool {
        !self.ssid().is_empty()
    }

    pub fn to_credentials(&self) -> anyhow::Result<StationCredentials> {
        StationCredentials::new(self.ssid(), self.password())
    }

    pub fn load_credentials(&mut self, creds: &StationCredentials) {
        self.overwrite(Some(&creds.ssid), Some(&creds.password));
    }
}

fn copy_truncated(dst: &mut [u8], src: &str) {
    let mut n = src.len().min(dst.len());
    while !src.is_char_boundary(n) {
        n -= 1;
    }
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

fn nul_terminated(buf: &[u8]) -> &str {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or_default()
}

/// Station credentials as persisted by a [`CredentialStore`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationCredentials {
    pub ssid: heapless::String<SSID_MAX_LEN>,
    pub password: heapless::String<PASSWORD_MAX_LEN>,
}

impl fmt::Debug for StationCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StationCredentials")
            .field("ssid", &self.ssid.as_str())
            .finish_non_exhaustive()
    }
}

impl StationCredentials {
    pub fn new(ssid: &str, password: &str) -> anyhow::Result<Self> {
        let mut c = Self {
            ssid: heapless::String::new(),
            password: heapless::String::new(),
        };
        c.ssid
            .push_str(ssid)
            .map_err(|_| anyhow!("SSID longer than {SSID_MAX_LEN} bytes"))?;
        c.password
            .push_str(password)
            .map_err(|_| anyhow!("password longer than {PASSWORD_MAX_LEN} bytes"))?;
        Ok(c)
    }

    /// Serialize into a CRC protected blob.
    pub fn to_blob(&self) -> anyhow::Result<Vec<u8>> {
        postcard::to_allocvec_crc32(self, CRC32.digest())
            .map_err(|e| anyhow!("credential encode error: {e:?}"))
    }

    /// `None` on a truncated or corrupted blob.
    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        match postcard::from_bytes_crc32(blob, CRC32.digest()) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("Discarding stored credentials: {e:?}");
                None
            }
        }
    }
}

/// Persistent storage of the station credentials.
pub trait CredentialStore: Send {
    fn load(&mut self) -> anyhow::Result<Option<StationCredentials>>;
    fn save(&mut self, creds: &StationCredentials) -> anyhow::Result<()>;
    fn clear(&mut self) -> anyhow::Result<()>;
}

// EOF
