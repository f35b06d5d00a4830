use std::fmt::{Debug, Display};
use std::io::{BufRead, Write};

use log::warn;

use super::Filesystem;

/// Known corruption patterns that may be fixed in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    /// Boot region checksum sector does not match the boot sectors
    VbrChecksum { stored: u32, computed: u32 },
    /// Entry set checksum of a file does not match its entries
    NodeChecksum {
        name: String,
        stored: u16,
        computed: u16,
    },
    /// In-use directory entry of an unrecognized type
    UnknownEntry { kind: u8, offset: u64 },
}

impl Display for Corruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VbrChecksum { stored, computed } => {
                write!(f, "invalid VBR checksum {stored:#x} (expected {computed:#x})")
            }
            Self::NodeChecksum {
                name,
                stored,
                computed,
            } => write!(
                f,
                "'{name}' has invalid checksum ({computed:#x} != {stored:#x})"
            ),
            Self::UnknownEntry { kind, offset } => {
                write!(f, "unknown entry type {kind:#x} at offset {offset}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the volume as is and carry on
    Accept,
    /// Rewrite the damaged structure
    Fix,
    /// Fail the operation
    Reject,
}

/// Decides what happens to a detected corruption
pub trait RepairPolicy: Debug {
    fn decide(&mut self, corruption: &Corruption) -> Decision;
}

/// Policy selected by the `repair` mount option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Repair {
    #[default]
    No,
    /// Prompt on the terminal
    Ask,
    Yes,
}

const QUESTION: &str = "Fix (Y/N)?";

impl RepairPolicy for Repair {
    fn decide(&mut self, _corruption: &Corruption) -> Decision {
        match self {
            Self::No => Decision::Reject,
            Self::Yes => {
                println!("{QUESTION} Y");
                Decision::Fix
            }
            Self::Ask => {
                let stdin = std::io::stdin();
                if ask(&mut stdin.lock(), &mut std::io::stdout()) {
                    Decision::Fix
                } else {
                    Decision::Reject
                }
            }
        }
    }
}

/// Repeat the question until a yes or no answer, end of input means no
fn ask(input: &mut impl BufRead, output: &mut impl Write) -> bool {
    loop {
        // prompt failures only affect what the user sees
        let _ = write!(output, "{QUESTION} ");
        let _ = output.flush();
        let mut answer = String::new();
        match input.read_line(&mut answer) {
            Ok(0) | Err(_) => return false,
            Ok(_) => match answer.trim_end_matches(['\r', '\n']) {
                a if a.eq_ignore_ascii_case("y") => return true,
                a if a.eq_ignore_ascii_case("n") => return false,
                _ => continue,
            },
        }
    }
}

impl Filesystem {
    /// Report `corruption` and consult the repair policy.
    /// Fixing needs a writable volume, so read-only mounts get [`Decision::Reject`] instead.
    pub(crate) fn ask_to_fix(&mut self, corruption: Corruption) -> Decision {
        self.errors += 1;
        match self.repair.decide(&corruption) {
            Decision::Fix if self.read_only => {
                warn!("Unable to fix {corruption} on a read-only volume");
                Decision::Reject
            }
            decision => decision,
        }
    }

    /// Errors detected since mount
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Errors repaired since mount
    pub fn errors_fixed(&self) -> u32 {
        self.errors_fixed
    }
}
