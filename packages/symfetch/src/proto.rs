//! The wire protocol between the shadow filesystem and the fetch daemon.
//!
//! One request per connection over an abstract local stream socket:
//! `"<timestamp>:<prefix>:<path>"` followed by a single NUL byte. The reply
//! is the three bytes `"ok\0"`, or the connection is closed with no data on
//! refusal. EOF and timeout mean the same thing to a client: no content
//! guaranteed.

use std::str::FromStr;

use derive_more::{Display, Error};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

/// Abstract socket name the daemon listens on (the kernel prepends the NUL).
pub const SOCKET_NAME: &[u8] = b"symfetch";

/// Reply sent once a fetch attempt has concluded.
pub const REPLY_OK: &[u8] = b"ok\0";

/// Prefix tag selecting a debug tree and the matching URL sub-root.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, StrumDisplay, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Prefix {
    /// Object debug info, served under the lib debug tree.
    Lib,
    /// Source files referenced by debug info.
    Src,
}

impl Prefix {
    pub const ALL: [Prefix; 2] = [Prefix::Lib, Prefix::Src];
}

/// A fetch request: the client's last known mtime of the cached target
/// (zero for "not cached, I need this synchronously"), the tree, and the
/// absolute path below the mount.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Request {
    pub timestamp: u64,
    pub prefix: Prefix,
    pub path: String,
}

/// Why a request line was rejected. Rejections are silent on the wire; the
/// reason only feeds logging.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Display, Error)]
pub enum Malformed {
    #[display("request line is not utf-8")]
    Encoding,
    #[display("request line does not have two separators")]
    MissingSeparator,
    #[display("timestamp is not a decimal integer")]
    BadTimestamp,
    #[display("unknown prefix tag")]
    BadPrefix,
    #[display("path is the tree root")]
    RootPath,
    #[display("path is not absolute")]
    NotAbsolute,
    #[display("path or prefix contains a traversal sequence")]
    Traversal,
    #[display("path contains a forbidden byte")]
    ForbiddenByte,
}

impl Request {
    /// Parse a request line as received from the socket. The buffer may
    /// include the trailing NUL and anything after it.
    pub fn parse(buf: &[u8]) -> Result<Self, Malformed> {
        let line = match buf.iter().position(|&b| b == 0) {
            Some(end) => &buf[..end],
            None => buf,
        };
        let line = std::str::from_utf8(line).map_err(|_| Malformed::Encoding)?;

        let (timestamp, rest) = line.split_once(':').ok_or(Malformed::MissingSeparator)?;
        let (prefix, path) = rest.split_once(':').ok_or(Malformed::MissingSeparator)?;
        let timestamp = timestamp.parse::<u64>().map_err(|_| Malformed::BadTimestamp)?;

        if prefix.contains("..") {
            return Err(Malformed::Traversal);
        }
        let prefix = Prefix::from_str(prefix).map_err(|_| Malformed::BadPrefix)?;

        // Debuggers stat the tree root itself when resolving debug info;
        // there is no artifact for it and the cache roots already exist.
        if path == "/" {
            return Err(Malformed::RootPath);
        }
        if !path.starts_with('/') {
            return Err(Malformed::NotAbsolute);
        }
        if path.contains("..") {
            return Err(Malformed::Traversal);
        }
        if path.contains('\'') || path.contains(';') {
            return Err(Malformed::ForbiddenByte);
        }

        Ok(Self {
            timestamp,
            prefix,
            path: path.to_owned(),
        })
    }

    /// Encode for the wire, NUL terminator included.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = format!("{}:{}:{}", self.timestamp, self.prefix, self.path).into_bytes();
        line.push(0);
        line
    }
}
