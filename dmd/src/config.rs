//! Typed configuration loaded once at startup from an INI file: global
//! `[LightDM]` settings, `[SeatDefaults]`, and one `[Seat:<name>]`
//! override section per configured seat layered over the defaults.

use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Clone, Debug)]
pub struct LightDmConfig {
    pub users_file: PathBuf,
    pub sessions_directory: PathBuf,
    pub greeters_directory: PathBuf,
    pub guest_account_script: Option<String>,
    pub minimum_vt: u32,
    pub user_authority_in_system_dir: bool,
    pub pam_service: String,
    pub pam_autologin_service: String,
}

impl Default for LightDmConfig {
    fn default() -> LightDmConfig {
        LightDmConfig {
            users_file: PathBuf::from("/etc/passwd"),
            sessions_directory: PathBuf::from("/usr/share/xsessions"),
            greeters_directory: PathBuf::from("/usr/share/xgreeters"),
            guest_account_script: None,
            minimum_vt: 7,
            user_authority_in_system_dir: false,
            pam_service: "lightdm".to_string(),
            pam_autologin_service: "lightdm-autologin".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SeatDefaultsConfig {
    pub xserver_command: Option<String>,
    pub xserver_layout: Option<String>,
    pub session_wrapper: Option<String>,
    pub greeter_session: Option<String>,
    pub autologin_user: Option<String>,
    pub autologin_user_timeout: Option<u64>,
    pub allow_guest: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub lightdm: LightDmConfig,
    pub seat_defaults: SeatDefaultsConfig,
    pub seat_overrides: Vec<(String, SeatDefaultsConfig)>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)?;
        Config::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config> {
        let ini = inish::Ini::parse(content)?;

        let mut lightdm = LightDmConfig::default();
        if let Some(section) = ini.section("LightDM") {
            if let Some(v) = section.get("users-file") {
                lightdm.users_file = PathBuf::from(v);
            }
            if let Some(v) = section.get("sessions-directory") {
                lightdm.sessions_directory = PathBuf::from(v);
            }
            if let Some(v) = section.get("greeters-directory") {
                lightdm.greeters_directory = PathBuf::from(v);
            }
            lightdm.guest_account_script = section.get("guest-account-script").map(str::to_string);
            if let Some(v) = section.get("minimum-vt") {
                lightdm.minimum_vt = parse_u32(v, "minimum-vt")?;
            }
            if let Some(v) = section.get("user-authority-in-system-dir") {
                lightdm.user_authority_in_system_dir = parse_bool(v);
            }
            if let Some(v) = section.get("pam-service") {
                lightdm.pam_service = v.to_string();
            }
            if let Some(v) = section.get("pam-autologin-service") {
                lightdm.pam_autologin_service = v.to_string();
            }
        }

        let seat_defaults = ini.section("SeatDefaults").map(seat_section).unwrap_or_default();

        let mut seat_overrides = Vec::new();
        for (name, section) in ini.sections() {
            if let Some(seat_name) = name.strip_prefix("Seat:") {
                seat_overrides.push((seat_name.to_string(), seat_section(section)));
            }
        }

        Ok(Config {
            lightdm,
            seat_defaults,
            seat_overrides,
        })
    }

    /// Returns the effective per-seat config: the defaults with any
    /// `[Seat:<name>]` override layered on top.
    pub fn seat_config(&self, name: &str) -> SeatDefaultsConfig {
        let mut merged = self.seat_defaults.clone();
        if let Some((_, overrides)) = self.seat_overrides.iter().find(|(n, _)| n == name) {
            merge_seat_config(&mut merged, overrides);
        }
        merged
    }
}

fn seat_section(section: &inish::Section) -> SeatDefaultsConfig {
    SeatDefaultsConfig {
        xserver_command: section.get("xserver-command").map(str::to_string),
        xserver_layout: section.get("xserver-layout").map(str::to_string),
        session_wrapper: section.get("session-wrapper").map(str::to_string),
        greeter_session: section.get("greeter-session").map(str::to_string),
        autologin_user: section.get("autologin-user").map(str::to_string),
        autologin_user_timeout: section.get("autologin-user-timeout").and_then(|v| v.parse().ok()),
        allow_guest: section.get("allow-guest").map(parse_bool),
    }
}

fn merge_seat_config(base: &mut SeatDefaultsConfig, overrides: &SeatDefaultsConfig) {
    macro_rules! over {
        ($field:ident) => {
            if overrides.$field.is_some() {
                base.$field = overrides.$field.clone();
            }
        };
    }
    over!(xserver_command);
    over!(xserver_layout);
    over!(session_wrapper);
    over!(greeter_session);
    over!(autologin_user);
    over!(autologin_user_timeout);
    over!(allow_guest);
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_u32(v: &str, field: &str) -> Result<u32> {
    v.parse()
        .map_err(|_| crate::error::Error::Config(format!("{}: expected an integer, got {:?}", field, v)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_complete_config() {
        let config = Config::parse(
            "
            [LightDM]
            minimum-vt=7
            pam-service=lightdm

            [SeatDefaults]
            xserver-command=/usr/bin/X
            allow-guest=true

            [Seat:seat1]
            autologin-user=bob
            allow-guest=false
            ",
        )
        .unwrap();

        assert_eq!(config.lightdm.minimum_vt, 7);
        assert_eq!(config.seat_defaults.xserver_command, Some("/usr/bin/X".to_string()));
        assert_eq!(config.seat_defaults.allow_guest, Some(true));

        let seat1 = config.seat_config("seat1");
        assert_eq!(seat1.autologin_user, Some("bob".to_string()));
        assert_eq!(seat1.xserver_command, Some("/usr/bin/X".to_string()));
        assert_eq!(seat1.allow_guest, Some(false));
    }

    #[test]
    fn unconfigured_seat_gets_plain_defaults() {
        let config = Config::parse("[LightDM]\nminimum-vt=7\n").unwrap();
        let seat = config.seat_config("seat0");
        assert_eq!(seat.xserver_command, None);
    }

    #[test]
    fn malformed_vt_is_a_config_error() {
        let err = Config::parse("[LightDM]\nminimum-vt=not-a-number\n").unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }
}
