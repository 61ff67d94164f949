//! Desktop-entry session files in the configured sessions directory.
//! `inish`'s `.ini`-shaped parser reads these fine even though the
//! desktop-entry format is a separate spec — the subset used here
//! (`[Desktop Entry]`, `Key=Value`, `#` comments) is a strict subset.

use std::fs;
use std::path::Path;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionType {
    X,
    Wayland,
    Tty,
}

impl SessionType {
    fn parse(s: &str) -> SessionType {
        match s {
            "wayland" => SessionType::Wayland,
            "tty" => SessionType::Tty,
            _ => SessionType::X,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub key: String,
    pub name: String,
    pub comment: String,
    pub exec: String,
    pub session_type: SessionType,
    pub desktop_names: Vec<String>,
    pub allow_greeter: bool,
}

impl SessionDescriptor {
    pub fn load(path: &Path) -> Result<SessionDescriptor> {
        let key = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = fs::read_to_string(path)?;
        let ini = inish::Ini::parse(&content)?;
        let section = ini.section("Desktop Entry");

        let name = section.and_then(|s| s.get("Name")).unwrap_or(&key).to_string();
        let comment = section.and_then(|s| s.get("Comment")).unwrap_or("").to_string();
        let exec = section.and_then(|s| s.get("Exec")).unwrap_or("").to_string();
        let session_type = section
            .and_then(|s| s.get("X-LightDM-Session-Type"))
            .map(SessionType::parse)
            .unwrap_or(SessionType::X);
        let desktop_names = section
            .and_then(|s| s.get("DesktopNames"))
            .map(|v| v.split(';').filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        let allow_greeter = section
            .and_then(|s| s.get("X-LightDM-Allow-Greeter"))
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(SessionDescriptor {
            key,
            name,
            comment,
            exec,
            session_type,
            desktop_names,
            allow_greeter,
        })
    }

    /// Loads every `.desktop` file directly under `dir`. Files that fail
    /// to parse are skipped with a warning rather than aborting startup —
    /// one malformed session shouldn't take down the whole daemon.
    pub fn load_directory(dir: &Path) -> Vec<SessionDescriptor> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "desktop").unwrap_or(false))
            .filter_map(|p| match SessionDescriptor::load(&p) {
                Ok(d) => Some(d),
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "skipping malformed session descriptor");
                    None
                }
            })
            .collect()
    }

    pub fn argv(&self) -> Vec<String> {
        self.exec.split_whitespace().map(str::to_string).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_minimal_session_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gnome.desktop");
        fs::write(
            &path,
            "[Desktop Entry]\nName=GNOME\nExec=gnome-session\nDesktopNames=GNOME\n",
        )
        .unwrap();

        let descriptor = SessionDescriptor::load(&path).unwrap();
        assert_eq!(descriptor.key, "gnome");
        assert_eq!(descriptor.name, "GNOME");
        assert_eq!(descriptor.argv(), vec!["gnome-session"]);
        assert_eq!(descriptor.desktop_names, vec!["GNOME"]);
        assert_eq!(descriptor.session_type, SessionType::X);
        assert!(!descriptor.allow_greeter);
    }

    #[test]
    fn missing_directory_yields_no_descriptors_not_an_error() {
        assert!(SessionDescriptor::load_directory(Path::new("/nonexistent")).is_empty());
    }
}
