//! Gate classification for VCS invocations.
//!
//! Rules, first match wins:
//! 1. `push`, `fetch`, `pull`, `clone` gate with reason `Push`.
//! 2. `commit` gates with `SigningCommit` when signing is requested on the
//!    command line (`-S`, `-S<key>`, `--gpg-sign[=<key>]`) or by
//!    `commit.gpgsign`, unless `--no-gpg-sign` comes last.
//! 3. `tag` gates with `SigningTag` when `-s`, `--sign`, `-u <key>` or
//!    `--local-user` is given, or `tag.gpgsign` is set and the invocation
//!    creates a tag. `--no-sign` cancels.
//! 4. Everything else passes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    Push,
    SigningCommit,
    SigningTag,
    None,
}

impl GateReason {
    pub fn is_signing(self) -> bool {
        matches!(self, GateReason::SigningCommit | GateReason::SigningTag)
    }
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateReason::Push => write!(f, "push"),
            GateReason::SigningCommit => write!(f, "signing_commit"),
            GateReason::SigningTag => write!(f, "signing_tag"),
            GateReason::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub required: bool,
    pub reason: GateReason,
}

impl GateDecision {
    pub const PASS: GateDecision = GateDecision {
        required: false,
        reason: GateReason::None,
    };

    pub fn gate(reason: GateReason) -> Self {
        Self {
            required: true,
            reason,
        }
    }
}

/// Persisted signing defaults (`commit.gpgsign`, `tag.gpgsign`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningDefaults {
    pub commit_gpgsign: bool,
    pub tag_gpgsign: bool,
}

pub const TRANSPORT_COMMANDS: [&str; 4] = ["push", "fetch", "pull", "clone"];

pub fn classify(name: &str, args: &[String], defaults: SigningDefaults) -> GateDecision {
    if TRANSPORT_COMMANDS.contains(&name) {
        return GateDecision::gate(GateReason::Push);
    }
    match name {
        "commit" => {
            let sign = commit_sign_flag(args).unwrap_or(defaults.commit_gpgsign);
            if sign {
                GateDecision::gate(GateReason::SigningCommit)
            } else {
                GateDecision::PASS
            }
        }
        "tag" => {
            let scan = scan_tag(args);
            let sign = match scan.explicit {
                Some(explicit) => explicit,
                None => defaults.tag_gpgsign && scan.creates,
            };
            if sign {
                GateDecision::gate(GateReason::SigningTag)
            } else {
                GateDecision::PASS
            }
        }
        _ => GateDecision::PASS,
    }
}

/// Short options of `commit` that consume a value.
const COMMIT_SHORT_VALUE: &[char] = &['m', 'F', 'C', 'c', 't'];
/// Long options of `commit` that consume the next argument when given
/// without `=`.
const COMMIT_LONG_VALUE: &[&str] = &[
    "--message",
    "--file",
    "--author",
    "--date",
    "--template",
    "--reuse-message",
    "--reedit-message",
    "--fixup",
    "--squash",
    "--cleanup",
    "--trailer",
    "--pathspec-from-file",
];

/// Last explicit signing flag on a commit line, if any.
fn commit_sign_flag(args: &[String]) -> Option<bool> {
    let mut sign = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let arg = arg.as_str();
        if arg == "--" {
            break;
        }
        if let Some(long) = arg.strip_prefix("--") {
            let name = long.split('=').next().unwrap_or(long);
            match name {
                "gpg-sign" => sign = Some(true),
                "no-gpg-sign" => sign = Some(false),
                _ if !long.contains('=') && COMMIT_LONG_VALUE.contains(&arg) => {
                    iter.next();
                }
                _ => {}
            }
            continue;
        }
        if let Some(cluster) = arg.strip_prefix('-').filter(|c| !c.is_empty()) {
            for (i, ch) in cluster.char_indices() {
                if ch == 'S' {
                    // The rest of the cluster is the key id.
                    sign = Some(true);
                    break;
                }
                if COMMIT_SHORT_VALUE.contains(&ch) {
                    if i + ch.len_utf8() == cluster.len() {
                        iter.next();
                    }
                    break;
                }
            }
        }
    }
    sign
}

#[derive(Debug, Default)]
struct TagScan {
    explicit: Option<bool>,
    /// False for list, delete and verify modes.
    creates: bool,
}

const TAG_SHORT_VALUE: &[char] = &['m', 'F'];
const TAG_LONG_VALUE: &[&str] = &[
    "--message",
    "--file",
    "--cleanup",
    "--sort",
    "--format",
    "--color",
];

fn scan_tag(args: &[String]) -> TagScan {
    let mut scan = TagScan::default();
    let mut listing = false;
    let mut positional = 0usize;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let arg = arg.as_str();
        if arg == "--" {
            positional += iter.len();
            break;
        }
        if let Some(long) = arg.strip_prefix("--") {
            let name = long.split('=').next().unwrap_or(long);
            match name {
                "sign" => scan.explicit = Some(true),
                "no-sign" => scan.explicit = Some(false),
                "local-user" => {
                    scan.explicit = Some(true);
                    if !long.contains('=') {
                        iter.next();
                    }
                }
                "list" | "delete" | "verify" | "column" => listing = true,
                "contains" | "no-contains" | "points-at" | "merged" | "no-merged" => {
                    listing = true;
                    if !long.contains('=') {
                        iter.next();
                    }
                }
                _ if !long.contains('=') && TAG_LONG_VALUE.contains(&arg) => {
                    iter.next();
                }
                _ => {}
            }
            continue;
        }
        if let Some(cluster) = arg.strip_prefix('-').filter(|c| !c.is_empty()) {
            for (i, ch) in cluster.char_indices() {
                let last = i + ch.len_utf8() == cluster.len();
                match ch {
                    's' => scan.explicit = Some(true),
                    'u' => {
                        scan.explicit = Some(true);
                        if last {
                            iter.next();
                        }
                        break;
                    }
                    'l' | 'd' | 'v' => listing = true,
                    // `-n<num>` carries its count attached.
                    'n' => {
                        listing = true;
                        break;
                    }
                    c if TAG_SHORT_VALUE.contains(&c) => {
                        if last {
                            iter.next();
                        }
                        break;
                    }
                    _ => {}
                }
            }
            continue;
        }
        positional += 1;
    }
    // A bare `git tag` lists.
    scan.creates = !listing && positional > 0;
    scan
}

/// A VCS command line split at the subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Global options before the subcommand, passed through verbatim.
    pub globals: Vec<String>,
    pub name: Option<String>,
    pub args: Vec<String>,
}

/// Global options that take a separate value argument.
const GLOBAL_VALUE: &[&str] = &[
    "-C",
    "-c",
    "--git-dir",
    "--work-tree",
    "--namespace",
    "--config-env",
];

/// Find the subcommand in `argv` (without the program name), skipping VCS
/// global options.
pub fn split_invocation(argv: &[String]) -> Invocation {
    let mut globals = Vec::new();
    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        if !arg.starts_with('-') || arg == "-" {
            return Invocation {
                globals,
                name: Some(arg.clone()),
                args: iter.cloned().collect(),
            };
        }
        globals.push(arg.clone());
        if arg == "--" {
            break;
        }
        if GLOBAL_VALUE.contains(&arg.as_str()) {
            if let Some(value) = iter.next() {
                globals.push(value.clone());
            }
        }
    }
    Invocation {
        globals,
        name: None,
        args: Vec::new(),
    }
}
