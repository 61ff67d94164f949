//! Per-session MIT-MAGIC-COOKIE file, written in the standard X authority
//! binary record format: `family(2) | addr(2+N) | display(2+N) |
//! name(2+N) | data(2+N)`, all lengths big-endian u16.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};
use rand::RngCore;

use crate::error::{Error, Result};
use crate::privilege::PrivilegeGuard;

pub const PROTOCOL_NAME: &str = "MIT-MAGIC-COOKIE-1";
const FAMILY_LOCAL: u16 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthCookie(pub [u8; 16]);

impl AuthCookie {
    pub fn generate() -> AuthCookie {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        AuthCookie(bytes)
    }
}

pub struct XAuthorityFile {
    pub path: PathBuf,
    pub owner_uid: u32,
}

impl XAuthorityFile {
    /// Writes a fresh Xauthority file binding `cookie` to `display`
    /// (e.g. `:0`), owned by `owner_uid`/`owner_gid`.
    ///
    /// Tries `home/.Xauthority` first; if the home directory isn't
    /// writable even as root (e.g. an automounted home not yet
    /// mounted), falls back to `fallback_dir/.Xauthority-<display>`.
    pub fn write(
        cookie: AuthCookie,
        display: &str,
        owner_uid: u32,
        owner_gid: u32,
        home: &Path,
        fallback_dir: &Path,
    ) -> Result<XAuthorityFile> {
        let preferred = home.join(".Xauthority");
        match Self::write_at(&preferred, cookie, display, owner_uid, owner_gid) {
            Ok(()) => Ok(XAuthorityFile {
                path: preferred,
                owner_uid,
            }),
            Err(_) => {
                fs::create_dir_all(fallback_dir)?;
                let fallback = fallback_dir.join(format!(".Xauthority-{}", display.trim_start_matches(':')));
                Self::write_at(&fallback, cookie, display, owner_uid, owner_gid)?;
                Ok(XAuthorityFile {
                    path: fallback,
                    owner_uid,
                })
            }
        }
    }

    fn write_at(
        path: &Path,
        cookie: AuthCookie,
        display: &str,
        owner_uid: u32,
        owner_gid: u32,
    ) -> Result<()> {
        let record = encode_record(display, &cookie.0);

        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?;
            tmp.write_all(&record)?;
            tmp.sync_all()?;
        }

        // chown needs root; the rename itself just needs to stay on the
        // same filesystem so it's atomic.
        let _guard = PrivilegeGuard::enter(Uid::from_raw(0), Gid::from_raw(0));
        nix::unistd::chown(
            &tmp_path,
            Some(Uid::from_raw(owner_uid)),
            Some(Gid::from_raw(owner_gid)),
        )
        .map_err(|e| Error::Spawn(format!("chown {}: {}", tmp_path.display(), e)))?;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<AuthCookie> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        decode_record(&buf)
    }

    /// Unlinking is best-effort: a missing file or a permissions race at
    /// session teardown is not worth failing the whole teardown over.
    pub fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn encode_record(display: &str, cookie: &[u8; 16]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&FAMILY_LOCAL.to_be_bytes());
    write_field(&mut out, hostname().as_bytes());
    write_field(&mut out, display.trim_start_matches(':').as_bytes());
    write_field(&mut out, PROTOCOL_NAME.as_bytes());
    write_field(&mut out, cookie);
    out
}

fn decode_record(buf: &[u8]) -> Result<AuthCookie> {
    if buf.len() < 2 {
        return Err(Error::Spawn("truncated xauthority record".into()));
    }
    let pos = 2; // skip family
    let (_addr, pos) = read_field(buf, pos)?;
    let (_display, pos) = read_field(buf, pos)?;
    let (_name, pos) = read_field(buf, pos)?;
    let (data, _) = read_field(buf, pos)?;
    if data.len() != 16 {
        return Err(Error::Spawn("xauthority cookie is not 16 bytes".into()));
    }
    let mut cookie = [0u8; 16];
    cookie.copy_from_slice(data);
    Ok(AuthCookie(cookie))
}

fn write_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn read_field(buf: &[u8], pos: usize) -> Result<(&[u8], usize)> {
    if pos + 2 > buf.len() {
        return Err(Error::Spawn("truncated xauthority field length".into()));
    }
    let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
    let start = pos + 2;
    if start + len > buf.len() {
        return Err(Error::Spawn("truncated xauthority field body".into()));
    }
    Ok((&buf[start..start + len], start + len))
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn round_trips_through_the_binary_format() {
        let cookie = AuthCookie::generate();
        let record = encode_record(":0", &cookie.0);
        let decoded = decode_record(&record).unwrap();
        assert_eq!(decoded, cookie);
    }

    #[test]
    fn write_then_read_back_same_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let cookie = AuthCookie::generate();
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let file = XAuthorityFile::write(cookie, ":7", uid, gid, dir.path(), dir.path()).unwrap();
        let meta = fs::metadata(&file.path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let read_back = XAuthorityFile::read(&file.path).unwrap();
        assert_eq!(read_back, cookie);
    }
}
