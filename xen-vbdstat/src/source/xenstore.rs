//! Key-value lookups against xenstore
use std::{
    fmt,
    io,
    process::{Command, Stdio}
};

/// Read-only access to a hierarchical key-value store such as xenstore.
pub trait KeyValueStore: fmt::Debug {
    /// Read the value stored at `key`.  A missing key is `NotFound`.
    fn read(&self, key: &str) -> io::Result<String>;
}

/// Looks keys up with the `xenstore-read` utility.
#[derive(Clone, Debug)]
pub struct XenstoreCli {
    program: String,
}

impl XenstoreCli {
    pub fn new<S: Into<String>>(program: S) -> Self {
        XenstoreCli { program: program.into() }
    }
}

impl Default for XenstoreCli {
    fn default() -> Self {
        Self::new("xenstore-read")
    }
}

impl KeyValueStore for XenstoreCli {
    fn read(&self, key: &str) -> io::Result<String> {
        let output = Command::new(&self.program)
            .arg(key)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(io::Error::new(io::ErrorKind::NotFound,
                                      format!("no xenstore key {}", key)));
        }
        String::from_utf8(output.stdout)
            .map(|s| s.trim_end().to_owned())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
