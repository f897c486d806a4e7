/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! Runtime configuration (SPEC_FULL §3 expansion) and the minimal bootstrap
//! command-file loader.
//!
//! The full reflection-driven command shell (`create PATH CLASS`, `@PATH`
//! dereference, arbitrary `PATH/method` invocation) is an explicit
//! out-of-scope collaborator — we only honor the subset of its grammar
//! needed to load configuration: `set NAME VALUE` and
//! `source [-s] FILE`. A process wanting the full command tree is expected
//! to bring its own shell and hand us a `BusConfig` directly.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Two-character operator-chosen session suffix.
    pub session_suffix: String,
    pub bind_udp: SocketAddr,
    pub bind_tcp: SocketAddr,
    #[serde(default)]
    pub multicast_peers: Vec<SocketAddr>,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_rewind_write_buffer_size")]
    pub rewind_write_buffer_size: usize,
    #[serde(default = "default_catchup_delay_ms")]
    pub catchup_delay_ms: u64,
}

fn default_heartbeat_timeout_ms() -> u64 {
    100
}

fn default_rewind_write_buffer_size() -> usize {
    64 * 1024
}

fn default_catchup_delay_ms() -> u64 {
    1
}

impl BusConfig {
    pub fn from_toml_str(text: &str) -> BusResult<BusConfig> {
        toml::from_str(text).map_err(|e| BusError::Bootstrap(e.to_string()))
    }

    pub fn from_toml_file(path: &Path) -> BusResult<BusConfig> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Parses the `set`/`source` subset of the command-file grammar into a
/// flat variable table, then materializes it into a `BusConfig`.
/// Lines are `set NAME VALUE`, `source [-s] FILE`, `#`-prefixed comments,
/// or blank. `$NAME`/`${NAME}` expand against previously-set variables.
pub struct Bootstrap {
    vars: HashMap<String, String>,
}

impl Bootstrap {
    pub fn new() -> Bootstrap {
        Bootstrap {
            vars: HashMap::new(),
        }
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str())
    }

    /// Loads a command file, following `source` directives relative to the
    /// including file's directory. Fatal on any parse error: shell/command
    /// errors during bootstrap are unrecoverable.
    pub fn load_file(&mut self, path: &Path) -> BusResult<()> {
        let text = fs::read_to_string(path).map_err(BusError::Io)?;
        let base_dir = path.parent().map(Path::to_path_buf);
        self.load_str(&text, base_dir.as_deref())
    }

    fn load_str(&mut self, text: &str, base_dir: Option<&Path>) -> BusResult<()> {
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                ["set", name, value] => {
                    let expanded = self.expand(value);
                    self.vars.insert((*name).to_string(), expanded);
                }
                ["source", file] => self.source(file, base_dir)?,
                ["source", "-s", file] => self.source(file, base_dir)?,
                _ => {
                    return Err(BusError::Bootstrap(format!(
                        "line {}: unsupported bootstrap directive: {}",
                        lineno + 1,
                        line
                    )))
                }
            }
        }
        Ok(())
    }

    fn source(&mut self, file: &str, base_dir: Option<&Path>) -> BusResult<()> {
        let path = match base_dir {
            Some(dir) => dir.join(file),
            None => PathBuf::from(file),
        };
        self.load_file(&path)
    }

    /// Expands `$NAME` and `${NAME}` references against already-set
    /// variables. Unknown references expand to the empty string.
    fn expand(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut chars = value.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            if chars.peek() == Some(&'{') {
                chars.next();
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(self.var(&name).unwrap_or(""));
            } else {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(self.var(&name).unwrap_or(""));
            }
        }
        out
    }

    /// Builds a `BusConfig` from the variables collected so far. Requires
    /// `session_suffix`, `bind_udp`, and `bind_tcp` to have been `set`.
    pub fn into_config(self) -> BusResult<BusConfig> {
        let session_suffix = self
            .require("session_suffix")?
            .to_string();
        let bind_udp = self.parse_addr("bind_udp")?;
        let bind_tcp = self.parse_addr("bind_tcp")?;
        Ok(BusConfig {
            session_suffix,
            bind_udp,
            bind_tcp,
            multicast_peers: Vec::new(),
            store_path: self.vars.get("store_path").map(PathBuf::from),
            heartbeat_timeout_ms: self
                .vars
                .get("heartbeat_timeout_ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_heartbeat_timeout_ms),
            rewind_write_buffer_size: self
                .vars
                .get("rewind_write_buffer_size")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rewind_write_buffer_size),
            catchup_delay_ms: self
                .vars
                .get("catchup_delay_ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_catchup_delay_ms),
        })
    }

    fn require(&self, name: &str) -> BusResult<&str> {
        self.var(name)
            .ok_or_else(|| BusError::Bootstrap(format!("missing required variable: {}", name)))
    }

    fn parse_addr(&self, name: &str) -> BusResult<SocketAddr> {
        self.require(name)?
            .parse()
            .map_err(|_| BusError::Bootstrap(format!("{} is not a socket address", name)))
    }
}

impl Default for Bootstrap {
    fn default() -> Bootstrap {
        Bootstrap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_variables_and_builds_config() {
        let mut b = Bootstrap::new();
        b.load_str(
            "set host 127.0.0.1\nset session_suffix AA\nset bind_udp ${host}:9001\nset bind_tcp ${host}:9002\n",
            None,
        )
        .unwrap();
        let cfg = b.into_config().unwrap();
        assert_eq!(cfg.session_suffix, "AA");
        assert_eq!(cfg.bind_udp, "127.0.0.1:9001".parse().unwrap());
    }

    #[test]
    fn missing_required_var_is_bootstrap_error() {
        let b = Bootstrap::new();
        assert!(matches!(b.into_config(), Err(BusError::Bootstrap(_))));
    }
}
