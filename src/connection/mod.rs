//! User-configured connections and the transport registry entries they
//! refer to.
//!
//! A connection is a `(transport, secret, addr)` tuple. Its id is derived
//! from those three fields so connection history can be matched up across
//! restarts. Connections can also be shared as a single pasteable string,
//! see [`Connection::encode`] and [`decode_connection`].

use crate::{Error, Result};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// Version prefix of the shareable connection format. Always two characters.
pub const SHAREABLE_FORMAT_VERSION: &str = "ai";

/// A saved transport connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Connection {
    /// Name of the transport in the transport registry
    #[serde(alias = "t")]
    pub transport: String,
    /// Transport specific credential
    #[serde(default, alias = "s")]
    pub secret: String,
    /// Remote address handed to the transport
    #[serde(default, alias = "a")]
    pub addr: String,
    #[serde(default)]
    pub disabled: bool,
    /// Protected connections cannot be deleted by the user
    #[serde(default)]
    pub protected: bool,
    /// Derived from transport, secret and addr; never persisted
    #[serde(skip)]
    pub id: String,
}

/// Wire shape of the shareable format
#[derive(Serialize, Deserialize)]
struct SharedConnection {
    t: String,
    s: String,
    a: String,
}

impl Connection {
    /// Create a connection with its id already derived
    pub fn new(
        transport: impl Into<String>,
        secret: impl Into<String>,
        addr: impl Into<String>,
    ) -> Self {
        let mut connection = Connection {
            transport: transport.into(),
            secret: secret.into(),
            addr: addr.into(),
            ..Default::default()
        };
        connection.ensure_id();
        connection
    }

    /// Derive the stable identifier if it is not set yet.
    pub fn ensure_id(&mut self) {
        if !self.id.is_empty() {
            return;
        }
        let mut hasher = Sha256::new();
        hasher.update(b"ADDR");
        hasher.update(self.addr.as_bytes());
        hasher.update(b"TRANSPORT");
        hasher.update(self.transport.as_bytes());
        hasher.update(b"SECRET");
        hasher.update(self.secret.as_bytes());
        self.id = URL_SAFE_NO_PAD.encode(hasher.finalize());
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    /// Short human readable name
    pub fn display_name(&self) -> String {
        let short: String = self.id.chars().take(8).collect();
        format!("{} ({})", short, self.transport)
    }

    /// Encode as a single string that a user can paste into another
    /// installation. Flags and the id are not part of the encoding.
    pub fn encode(&self) -> Result<String> {
        let shared = SharedConnection {
            t: self.transport.clone(),
            s: self.secret.clone(),
            a: self.addr.clone(),
        };
        let json = serde_json::to_vec(&shared)?;

        let mut out = String::with_capacity(2 + json.len() * 4 / 3 + 4);
        out.push_str(SHAREABLE_FORMAT_VERSION);
        URL_SAFE.encode_string(json, &mut out);
        Ok(out)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Decode the shareable format produced by [`Connection::encode`].
pub fn decode_connection(s: &str) -> Result<Connection> {
    let s = s.trim();
    if s.len() < 3 {
        return Err(Error::parse("too short format"));
    }

    // the prefix may end inside a multi-byte character
    let data = match s.get(..2) {
        Some(version) if version == SHAREABLE_FORMAT_VERSION => &s[2..],
        _ => return Err(Error::parse("unknown format version")),
    };

    let json = URL_SAFE.decode(data)?;
    let shared: SharedConnection =
        serde_json::from_slice(&json).map_err(|e| Error::parse(format!("cannot read json: {}", e)))?;

    Ok(Connection::new(shared.t, shared.s, shared.a))
}

/// Transport registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Transport {
    /// Filled from the map key when loaded from configuration
    pub name: String,
    /// Implemented inside this binary
    pub bundled: bool,
    /// External command to launch
    pub command: Option<PathBuf>,
    /// Extra arguments for the command
    pub args: Vec<String>,
    /// The transport is a tor pluggable transport adapter
    pub torpt: bool,
}

impl Transport {
    /// A transport implemented inside this binary
    pub fn bundled(name: impl Into<String>) -> Self {
        Transport {
            name: name.into(),
            bundled: true,
            ..Default::default()
        }
    }

    /// An external transport command
    pub fn external(name: impl Into<String>, command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Transport {
            name: name.into(),
            command: Some(command.into()),
            args,
            ..Default::default()
        }
    }

    /// Resolve the program to launch for this transport.
    pub fn launch_command(&self) -> Result<PathBuf> {
        if self.bundled {
            return std::env::current_exe()
                .map_err(|e| Error::config(format!("cannot locate own executable: {}", e)));
        }
        match &self.command {
            Some(command) if !command.as_os_str().is_empty() => Ok(command.clone()),
            _ => Err(Error::config(format!(
                "no command registered for transport {}",
                self.name
            ))),
        }
    }
}
