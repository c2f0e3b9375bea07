use std::path::{Path, PathBuf};

use tracing::warn;

/// Fallback search directory when `XDG_CONFIG_DIRS` is unset, mirroring the
/// C source's `PACKAGE_SYSCONF_DIR` (`cockpitconf.c`).
const DEFAULT_SYSCONF_DIR: &str = "/etc";

/// `cockpit.conf` reader (§6.3), grounded on `cockpitconf.c`.
///
/// Section and key names are case-insensitive; values are case-sensitive.
/// Later definitions win over earlier ones within and across files, the way
/// the C source prepends each newly parsed entry and does a forward scan.
#[derive(Debug, Default, Clone)]
pub struct Config {
    // Stored oldest-first; lookups scan from the end so later entries win.
    entries: Vec<(String, String, String)>,
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and merges every `cockpit/<file_name>` found along the search
    /// path (§6.3), or a single file if `file_name` contains `/`.
    pub fn load(file_name: &str) -> Self {
        let mut config = Config::new();
        if file_name.contains('/') {
            config.load_file(Path::new(file_name));
        } else {
            for dir in Self::search_dirs() {
                config.load_file(&dir.join("cockpit").join(file_name));
            }
        }
        config
    }

    pub fn search_dirs() -> Vec<PathBuf> {
        if let Ok(val) = std::env::var("XDG_CONFIG_DIRS") {
            if !val.is_empty() {
                return val.split(':').map(PathBuf::from).collect();
            }
        }
        vec![PathBuf::from(DEFAULT_SYSCONF_DIR)]
    }

    fn load_file(&mut self, path: &Path) {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(path = %path.display(), %err, "couldn't load configuration file");
                return;
            }
        };

        let mut section: Option<String> = None;
        for raw_line in contents.lines() {
            let line = raw_line.trim_start();
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let trimmed = line.trim_end();
            if let Some(name) = parse_section(trimmed) {
                section = Some(name);
                continue;
            }
            if let Some((key, value)) = parse_keyval(trimmed) {
                match &section {
                    Some(section) => self.entries.push((section.clone(), key, value)),
                    None => {
                        warn!(path = %path.display(), line = trimmed, "key=val line not in any section");
                    }
                }
                continue;
            }
            warn!(path = %path.display(), line = trimmed, "invalid configuration line");
        }
    }

    fn lookup(&self, section: &str, field: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(s, k, _)| s.eq_ignore_ascii_case(section) && k.eq_ignore_ascii_case(field))
            .map(|(_, _, v)| v.as_str())
    }

    pub fn string(&self, section: &str, field: &str) -> Option<&str> {
        self.lookup(section, field)
    }

    pub fn bool(&self, section: &str, field: &str, default: bool) -> bool {
        match self.lookup(section, field) {
            Some(v) => v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true") || v == "1",
            None => default,
        }
    }

    /// Splits on `delimiter` after stripping trailing whitespace (leading
    /// whitespace was already stripped by the line parser).
    pub fn strv(&self, section: &str, field: &str, delimiter: char) -> Option<Vec<String>> {
        let value = self.lookup(section, field)?;
        let trimmed = value.trim_end();
        if trimmed.is_empty() {
            return Some(vec![]);
        }
        Some(trimmed.split(delimiter).map(|s| s.to_owned()).collect())
    }

    pub fn uint(&self, section: &str, field: &str, default: u32, min: u32, max: u32) -> u32 {
        let Some(value) = self.lookup(section, field) else {
            return default;
        };
        match value.trim().parse::<i64>() {
            Ok(v) if v < min as i64 => {
                warn!(section, field, value, clamped = min, "value below minimum");
                min
            }
            Ok(v) if v > max as i64 => {
                warn!(section, field, value, clamped = max, "value above maximum");
                max
            }
            Ok(v) => v as u32,
            Err(_) => {
                warn!(section, field, value, default, "invalid value, using default");
                default
            }
        }
    }
}

fn parse_section(line: &str) -> Option<String> {
    let inner = line.strip_prefix('[')?.strip_suffix(']')?;
    if inner.is_empty() || inner.chars().any(|c| c.is_control()) {
        return None;
    }
    Some(inner.to_owned())
}

fn parse_keyval(line: &str) -> Option<(String, String)> {
    let eq = line.find('=')?;
    let key = line[..eq].trim_end();
    if key.is_empty() || !key.chars().all(is_key_char) {
        return None;
    }
    let value = line[eq + 1..].trim_start();
    Some((key.to_owned(), value.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> tempfile_like::TempFile {
        tempfile_like::TempFile::new(contents)
    }

    // A tiny inline stand-in for `tempfile` so this module has no extra
    // dev-dependency: writes to a process-unique path under std::env::temp_dir().
    mod tempfile_like {
        use std::path::PathBuf;

        pub struct TempFile {
            pub path: PathBuf,
        }

        impl TempFile {
            pub fn new(contents: &str) -> Self {
                let path = std::env::temp_dir().join(format!(
                    "cockpit-ssh-common-test-{}-{:?}",
                    std::process::id(),
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap()
                        .as_nanos()
                ));
                std::fs::write(&path, contents).unwrap();
                Self { path }
            }
        }

        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn parses_sections_and_case_insensitive_keys() {
        let f = write_temp("[Ssh-Login]\nconnectToUnknownHosts = yes\nTIMEOUT=45\n");
        let mut config = Config::new();
        config.load_file(&f.path);
        assert!(config.bool("ssh-login", "connectToUnknownHosts", false));
        assert_eq!(config.uint("SSH-LOGIN", "timeout", 30, 1, 900), 45);
    }

    #[test]
    fn later_definition_wins() {
        let f = write_temp("[A]\nkey=first\n[A]\nkey=second\n");
        let mut config = Config::new();
        config.load_file(&f.path);
        assert_eq!(config.string("A", "key"), Some("second"));
    }

    #[test]
    fn uint_out_of_range_clamps() {
        let f = write_temp("[Ssh-Login] \nresponse-timeout=10000\n");
        let mut config = Config::new();
        config.load_file(&f.path);
        assert_eq!(config.uint("Ssh-Login", "response-timeout", 30, 1, 900), 900);
    }

    #[test]
    fn uint_garbage_falls_back_to_default() {
        let f = write_temp("[Ssh-Login]\ntimeout=notanumber\n");
        let mut config = Config::new();
        config.load_file(&f.path);
        assert_eq!(config.uint("Ssh-Login", "timeout", 30, 1, 900), 30);
    }

    #[test]
    fn strv_splits_on_delimiter() {
        let f = write_temp("[Log]\nFatal = criticals warnings\n");
        let mut config = Config::new();
        config.load_file(&f.path);
        assert_eq!(
            config.strv("Log", "Fatal", ' '),
            Some(vec!["criticals".to_owned(), "warnings".to_owned()])
        );
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let f = write_temp("# a comment\n\n[A]\n# another\nkey = value\n");
        let mut config = Config::new();
        config.load_file(&f.path);
        assert_eq!(config.string("A", "key"), Some("value"));
    }
}
