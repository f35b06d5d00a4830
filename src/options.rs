use std::str::FromStr;

use log::{debug, error};

use crate::filesystem::{Mode, Repair};
use crate::Error;

/// Options given at mount time as a comma-separated list, e.g. `ro,uid=1000,umask=022`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Permission bits cleared on directories
    pub dmask: u32,
    /// Permission bits cleared on files
    pub fmask: u32,
    pub uid: u32,
    pub gid: u32,
    /// Do not update access times on read
    pub noatime: bool,
    pub mode: Mode,
    pub repair: Repair,
}

#[cfg(unix)]
fn effective_ids() -> (u32, u32) {
    unsafe { (libc::geteuid(), libc::getegid()) }
}

#[cfg(not(unix))]
fn effective_ids() -> (u32, u32) {
    (0, 0)
}

impl Default for MountOptions {
    fn default() -> Self {
        let (uid, gid) = effective_ids();
        Self {
            dmask: 0,
            fmask: 0,
            uid,
            gid,
            noatime: false,
            mode: Mode::ReadWrite,
            repair: Repair::No,
        }
    }
}

fn parse_number(key: &str, value: Option<&str>, radix: u32) -> Result<u32, Error> {
    let value = value.unwrap_or_default();
    u32::from_str_radix(value, radix).map_err(|_| {
        error!("Invalid value '{value}' for option '{key}'");
        Error::InvalidArgument
    })
}

impl FromStr for MountOptions {
    type Err = Error;

    fn from_str(options: &str) -> Result<Self, Self::Err> {
        let mut parsed = Self::default();
        let mut umask = 0;
        let mut dmask = None;
        let mut fmask = None;
        let mut ro = false;
        let mut ro_fallback = false;
        for option in options.split(',').filter(|o| !o.is_empty()) {
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (option, None),
            };
            match key {
                "umask" => umask = parse_number(key, value, 8)?,
                "dmask" => dmask = Some(parse_number(key, value, 8)?),
                "fmask" => fmask = Some(parse_number(key, value, 8)?),
                "uid" => parsed.uid = parse_number(key, value, 10)?,
                "gid" => parsed.gid = parse_number(key, value, 10)?,
                "noatime" => parsed.noatime = true,
                "ro" => ro = true,
                "ro_fallback" => ro_fallback = true,
                "repair" => {
                    parsed.repair = match parse_number(key, value, 10)? {
                        1 => Repair::Ask,
                        2 => Repair::Yes,
                        _ => Repair::No,
                    }
                }
                _ => debug!("Ignoring unknown mount option '{option}'"),
            }
        }
        parsed.dmask = dmask.unwrap_or(umask);
        parsed.fmask = fmask.unwrap_or(umask);
        parsed.mode = if ro {
            Mode::ReadOnly
        } else if ro_fallback {
            Mode::Any
        } else {
            Mode::ReadWrite
        };
        Ok(parsed)
    }
}
