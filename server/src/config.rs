/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! # Config file parsing
//!
//! The base spec's config grammar is Redis-conf-style key/value lines, not
//! the teacher's TOML+serde format (see `DESIGN.md` for why that divergence
//! is kept): one directive per line, blank lines and `#`-prefixed lines
//! ignored, `save` repeatable.

use {
    crate::snapshot::SaveCondition,
    std::{
        fs,
        net::IpAddr,
        path::{Path, PathBuf},
    },
};

const DEFAULT_BIND: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_APPENDFILENAME: &str = "appendonly.aof";
const DEFAULT_SNAPSHOT_FILENAME: &str = "dump.mcdb";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub requirepass: Option<String>,
    pub maxmemory: u64,
    pub maxmemory_policy: String,
    pub appendonly: bool,
    pub appendfilename: PathBuf,
    pub save_immediate: bool,
    pub save_conditions: Vec<SaveCondition>,
    pub snapshot_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            requirepass: None,
            maxmemory: 0,
            maxmemory_policy: "noeviction".to_string(),
            appendonly: false,
            appendfilename: PathBuf::from(DEFAULT_APPENDFILENAME),
            save_immediate: false,
            save_conditions: Vec::new(),
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_FILENAME),
        }
    }
}

impl Config {
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        let ip: IpAddr = self.bind.parse().map_err(|_| format!("invalid bind address '{}'", self.bind))?;
        Ok(std::net::SocketAddr::new(ip, self.port))
    }

    /// Reads `path`, resolving `appendfilename` and the snapshot path
    /// relative to the config file's own directory, per base spec §6.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path).map_err(|e| format!("reading config file '{}': {e}", path.display()))?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut cfg = Self::default();
        cfg.appendfilename = dir.join(DEFAULT_APPENDFILENAME);
        cfg.snapshot_path = dir.join(DEFAULT_SNAPSHOT_FILENAME);

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let key = parts.next().unwrap_or_default();
            let rest: Vec<&str> = parts.collect();
            match key {
                "bind" => cfg.bind = expect_one(&rest, "bind", lineno)?.to_string(),
                "port" => cfg.port = expect_one(&rest, "port", lineno)?.parse().map_err(|_| format!("line {}: invalid port", lineno + 1))?,
                "requirepass" => cfg.requirepass = Some(expect_one(&rest, "requirepass", lineno)?.to_string()),
                "maxmemory" => cfg.maxmemory = parse_memory(expect_one(&rest, "maxmemory", lineno)?)?,
                "maxmemory-policy" => cfg.maxmemory_policy = expect_one(&rest, "maxmemory-policy", lineno)?.to_string(),
                "appendonly" => cfg.appendonly = parse_bool(expect_one(&rest, "appendonly", lineno)?)?,
                "appendfilename" => cfg.appendfilename = dir.join(expect_one(&rest, "appendfilename", lineno)?),
                "save_immediate" => cfg.save_immediate = parse_bool(expect_one(&rest, "save_immediate", lineno)?)?,
                "save" => {
                    if rest.len() != 2 {
                        return Err(format!("line {}: 'save' expects 'save <seconds> <changes>'", lineno + 1));
                    }
                    let seconds = rest[0].parse().map_err(|_| format!("line {}: invalid save seconds", lineno + 1))?;
                    let changes = rest[1].parse().map_err(|_| format!("line {}: invalid save changes", lineno + 1))?;
                    cfg.save_conditions.push(SaveCondition { seconds, changes });
                }
                other => return Err(format!("line {}: unrecognized directive '{other}'", lineno + 1)),
            }
        }
        Ok(cfg)
    }
}

fn expect_one<'a>(rest: &[&'a str], key: &str, lineno: usize) -> Result<&'a str, String> {
    match rest {
        [value] => Ok(value),
        _ => Err(format!("line {}: '{key}' expects exactly one value", lineno + 1)),
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        other => Err(format!("invalid boolean '{other}'")),
    }
}

/// Accepts a raw byte count or a `kb`/`mb`/`gb`-suffixed value, case
/// insensitive, per base spec §6.
fn parse_memory(s: &str) -> Result<u64, String> {
    let lower = s.to_ascii_lowercase();
    let (digits, multiplier) = if let Some(d) = lower.strip_suffix("gb") {
        (d, 1024 * 1024 * 1024)
    } else if let Some(d) = lower.strip_suffix("mb") {
        (d, 1024 * 1024)
    } else if let Some(d) = lower.strip_suffix("kb") {
        (d, 1024)
    } else {
        (lower.as_str(), 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("invalid maxmemory value '{s}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("taskstored-config-test-{}-{}", std::process::id(), contents.len()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mcs.conf");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_apply_when_file_is_mostly_empty() {
        let path = write_temp_config("# nothing to see here\n");
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.bind, DEFAULT_BIND);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.requirepass.is_none());
        assert_eq!(cfg.maxmemory, 0);
    }

    #[test]
    fn parses_save_lines_and_memory_suffix() {
        let path = write_temp_config("port 7000\nmaxmemory 256mb\nsave 900 1\nsave 300 10\nappendonly yes\n");
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.maxmemory, 256 * 1024 * 1024);
        assert_eq!(cfg.save_conditions.len(), 2);
        assert_eq!(cfg.save_conditions[0].seconds, 900);
        assert!(cfg.appendonly);
    }

    #[test]
    fn rejects_unknown_directive() {
        let path = write_temp_config("bogus-directive value\n");
        assert!(Config::from_file(&path).is_err());
    }
}
