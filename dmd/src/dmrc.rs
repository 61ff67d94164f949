//! Per-user `~/.dmrc`, recording the last-chosen session and language so
//! the greeter can default to them on the next login. Same privilege-drop
//! and atomic-rename discipline as `xauthority`, just a different INI
//! shape: `[Desktop] Session=<key> Language=<code>`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use crate::error::Result;
use crate::privilege::PrivilegeGuard;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DmrcFile {
    pub path: PathBuf,
    pub owner_uid: u32,
    pub last_session: Option<String>,
    pub language: Option<String>,
}

impl DmrcFile {
    /// Reads `home/.dmrc`. A missing file is not an error — it just means
    /// the user has never logged in before, so the defaults are `None`.
    pub fn read(home: &Path, owner_uid: u32) -> Result<DmrcFile> {
        let path = home.join(".dmrc");
        let content = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DmrcFile {
                    path,
                    owner_uid,
                    last_session: None,
                    language: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let ini = inish::Ini::parse(&content)?;
        let desktop = ini.section("Desktop");
        let last_session = desktop.and_then(|s| s.get("Session")).map(str::to_string);
        let language = desktop.and_then(|s| s.get("Language")).map(str::to_string);

        Ok(DmrcFile {
            path,
            owner_uid,
            last_session,
            language,
        })
    }

    /// Writes this record back to `self.path`, under the target user's
    /// identity so network homes and quotas are respected.
    pub fn write(&self, owner_gid: u32) -> Result<()> {
        let mut content = String::from("[Desktop]\n");
        if let Some(session) = &self.last_session {
            content.push_str(&format!("Session={}\n", session));
        }
        if let Some(lang) = &self.language {
            content.push_str(&format!("Language={}\n", lang));
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?;
            tmp.write_all(content.as_bytes())?;
            tmp.sync_all()?;
        }

        let _guard = PrivilegeGuard::enter(Uid::from_raw(0), Gid::from_raw(0));
        nix::unistd::chown(
            &tmp_path,
            Some(Uid::from_raw(self.owner_uid)),
            Some(Gid::from_raw(owner_gid)),
        )
        .map_err(|e| crate::error::Error::Spawn(format!("chown {}: {}", tmp_path.display(), e)))?;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_file_yields_defaults_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dmrc = DmrcFile::read(dir.path(), 0).unwrap();
        assert_eq!(dmrc.last_session, None);
        assert_eq!(dmrc.language, None);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let dmrc = DmrcFile {
            path: dir.path().join(".dmrc"),
            owner_uid: uid,
            last_session: Some("gnome".into()),
            language: Some("en_US.UTF-8".into()),
        };
        dmrc.write(gid).unwrap();

        let read_back = DmrcFile::read(dir.path(), uid).unwrap();
        assert_eq!(read_back.last_session, Some("gnome".into()));
        assert_eq!(read_back.language, Some("en_US.UTF-8".into()));
    }

    #[test]
    fn malformed_ini_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".dmrc"), "Session=gnome\n").unwrap();
        let err = DmrcFile::read(dir.path(), 0).unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }
}
