//! Host lookup in an OpenSSH client configuration file.
//!
//! Supports the subset of `ssh_config(5)` needed to resolve an alias:
//! `Host` blocks with `*`/`?` wildcards and `!` negation, `Key value` and
//! `Key=value` forms, quoted arguments and comments. As in OpenSSH, the first
//! value obtained for a keyword wins. `Match` blocks are skipped.
//!
//! `Include` is followed when loading from a file: relative paths are taken
//! from `~/.ssh/`, `~` is expanded and `*`/`?` globs match in sorted order.

use super::error::TunnelError;
use super::types::{DEFAULT_SSH_PORT, HostParams};
use std::path::{Path, PathBuf};

/// Nesting limit for `Include`, same as OpenSSH
const MAX_INCLUDE_DEPTH: usize = 16;

/// Parsed client configuration
#[derive(Debug, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

#[derive(Debug)]
struct HostBlock {
    patterns: Vec<String>,
    /// `Match` blocks never apply
    matchable: bool,
    options: Vec<(String, String)>,
}

impl HostBlock {
    fn global() -> Self {
        Self {
            patterns: vec!["*".to_string()],
            matchable: true,
            options: Vec::new(),
        }
    }

    /// Same selector, no options yet
    fn continuation(&self) -> Self {
        Self {
            patterns: self.patterns.clone(),
            matchable: self.matchable,
            options: Vec::new(),
        }
    }

    fn matches(&self, alias: &str) -> bool {
        if !self.matchable {
            return false;
        }
        let alias = alias.to_ascii_lowercase();
        let mut matched = false;
        for pattern in &self.patterns {
            match pattern.strip_prefix('!') {
                Some(negated) if wildcard_match(negated, &alias) => return false,
                Some(_) => {}
                None => matched |= wildcard_match(pattern, &alias),
            }
        }
        matched
    }
}

#[derive(Debug)]
enum ParseFailure {
    Syntax { line: usize, message: String },
    Include(TunnelError),
}

impl SshConfig {
    /// Load and parse a configuration file, following `Include`. A missing
    /// file is an error.
    pub fn load(path: &Path) -> Result<Self, TunnelError> {
        let home = dirs::home_dir().ok_or(TunnelError::HomeDirUnavailable)?;
        Self::load_with_home(path, &home)
    }

    /// Like [`SshConfig::load`], resolving `~` and relative includes against `home`
    pub fn load_with_home(path: &Path, home: &Path) -> Result<Self, TunnelError> {
        let mut blocks = vec![HostBlock::global()];
        load_file(&mut blocks, path, home, 0)?;
        Ok(Self { blocks })
    }

    /// Parse configuration text. Errors carry the 1-based line number.
    ///
    /// `Include` lines are ignored here since there is no file to resolve them against.
    pub fn parse(content: &str) -> Result<Self, (usize, String)> {
        let mut blocks = vec![HostBlock::global()];
        match parse_into(&mut blocks, content, |_, _| Ok(())) {
            Ok(()) => Ok(Self { blocks }),
            Err(ParseFailure::Syntax { line, message }) => Err((line, message)),
            Err(ParseFailure::Include(e)) => Err((0, e.to_string())),
        }
    }

    /// First value of `key` among the blocks matching `alias`
    pub fn get(&self, alias: &str, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.blocks
            .iter()
            .filter(|block| block.matches(alias))
            .flat_map(|block| block.options.iter())
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Resolve connection parameters for `alias`, applying the usual fallbacks:
    /// hostname defaults to the alias, port to 22, user to `default_user`,
    /// identity to `~/.ssh/id_rsa`.
    pub fn resolve(&self, alias: &str, home: &Path, default_user: &str) -> HostParams {
        let hostname = self
            .get(alias, "HostName")
            .filter(|h| !h.is_empty())
            .unwrap_or(alias)
            .to_string();

        let port = match self.get(alias, "Port") {
            Some(raw) => raw.parse::<u16>().unwrap_or_else(|_| {
                tracing::debug!("Ignoring invalid Port '{}' for alias {}", raw, alias);
                DEFAULT_SSH_PORT
            }),
            None => DEFAULT_SSH_PORT,
        };

        let user = self
            .get(alias, "User")
            .filter(|u| !u.is_empty())
            .unwrap_or(default_user)
            .to_string();

        let identity_file = match self.get(alias, "IdentityFile") {
            Some(path) if !path.is_empty() => expand_tilde(path, home),
            _ => home.join(".ssh").join("id_rsa"),
        };

        HostParams {
            hostname,
            port,
            user,
            identity_file,
        }
    }
}

/// Look up `alias` in the client configuration, `~/.ssh/config` unless overridden.
pub fn resolve_host(config_path: Option<&Path>, alias: &str) -> Result<HostParams, TunnelError> {
    let home = dirs::home_dir().ok_or(TunnelError::HomeDirUnavailable)?;
    let path = match config_path {
        Some(path) => expand_tilde(&path.to_string_lossy(), &home),
        None => default_config_path(&home),
    };

    let config = SshConfig::load_with_home(&path, &home)?;
    let params = config.resolve(alias, &home, &current_user());
    tracing::debug!(
        "Resolved SSH alias '{}' from {}: {}",
        alias,
        path.display(),
        params.ssh_url()
    );
    Ok(params)
}

fn load_file(
    blocks: &mut Vec<HostBlock>,
    path: &Path,
    home: &Path,
    depth: usize,
) -> Result<(), TunnelError> {
    let content = std::fs::read_to_string(path).map_err(|source| TunnelError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;

    let include = |blocks: &mut Vec<HostBlock>, args: &[String]| {
        if depth + 1 > MAX_INCLUDE_DEPTH {
            return Err(TunnelError::ConfigParse {
                path: path.to_path_buf(),
                line: 0,
                message: "Include nested too deeply".to_string(),
            });
        }
        for arg in args {
            for included in expand_include(arg, home) {
                tracing::debug!("Including SSH config {}", included.display());
                load_file(blocks, &included, home, depth + 1)?;
            }
        }
        Ok(())
    };

    parse_into(blocks, &content, include).map_err(|failure| match failure {
        ParseFailure::Syntax { line, message } => TunnelError::ConfigParse {
            path: path.to_path_buf(),
            line,
            message,
        },
        ParseFailure::Include(e) => e,
    })
}

fn parse_into(
    blocks: &mut Vec<HostBlock>,
    content: &str,
    mut include: impl FnMut(&mut Vec<HostBlock>, &[String]) -> Result<(), TunnelError>,
) -> Result<(), ParseFailure> {
    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (keyword, rest) = split_keyword(line);
        let args = split_args(rest).map_err(|message| ParseFailure::Syntax {
            line: line_no,
            message,
        })?;
        if args.is_empty() {
            return Err(ParseFailure::Syntax {
                line: line_no,
                message: format!("missing argument for {}", keyword),
            });
        }

        if keyword.eq_ignore_ascii_case("host") {
            blocks.push(HostBlock {
                patterns: args.iter().map(|p| p.to_ascii_lowercase()).collect(),
                matchable: true,
                options: Vec::new(),
            });
        } else if keyword.eq_ignore_ascii_case("match") {
            blocks.push(HostBlock {
                patterns: Vec::new(),
                matchable: false,
                options: Vec::new(),
            });
        } else if keyword.eq_ignore_ascii_case("include") {
            let outer = blocks.len() - 1;
            include(blocks, args.as_slice()).map_err(ParseFailure::Include)?;
            // Lines after the Include belong to the block it appeared in
            if blocks.len() - 1 != outer {
                let resumed = blocks[outer].continuation();
                blocks.push(resumed);
            }
        } else if let Some(block) = blocks.last_mut() {
            block
                .options
                .push((keyword.to_ascii_lowercase(), args[0].clone()));
        }
    }

    Ok(())
}

/// Files named by one `Include` argument. Patterns matching nothing yield nothing.
fn expand_include(arg: &str, home: &Path) -> Vec<PathBuf> {
    let expanded = expand_tilde(arg, home);
    let pattern = if expanded.is_absolute() {
        expanded
    } else {
        home.join(".ssh").join(expanded)
    };

    let mut candidates = vec![PathBuf::new()];
    for component in pattern.components() {
        let part = component.as_os_str().to_string_lossy();
        if !part.contains(['*', '?']) {
            for candidate in &mut candidates {
                candidate.push(component);
            }
            continue;
        }

        let mut next = Vec::new();
        for dir in &candidates {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut names: Vec<String> = entries
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| !name.starts_with('.') && wildcard_match(&part, name))
                .collect();
            names.sort();
            next.extend(names.into_iter().map(|name| dir.join(name)));
        }
        candidates = next;
    }

    candidates.into_iter().filter(|path| path.is_file()).collect()
}

/// ~/.ssh/config
pub fn default_config_path(home: &Path) -> PathBuf {
    home.join(".ssh").join("config")
}

/// Expand a leading `~/` (or a bare `~`) to the home directory
pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        home.to_path_buf()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(path)
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

/// Split `Keyword value` / `Keyword=value` / `Keyword = value`
fn split_keyword(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let (keyword, rest) = line.split_at(end);
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim_start();
    (keyword, rest)
}

/// Whitespace-separated arguments, honouring double quotes
fn split_args(rest: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut chars = rest.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '#' {
            break;
        }
        let mut arg = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                arg.push(c);
            }
            if !closed {
                return Err("unterminated quoted argument".to_string());
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }

    Ok(args)
}

/// Glob match supporting `*` and `?`
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
