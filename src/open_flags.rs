use std::fmt;
use std::fmt::Formatter;
use std::fmt::LowerHex;
use std::fmt::UpperHex;

/// How the file should be opened: read-only, write-only, or read-write.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum OpenAccMode {
    /// Open file for reading only.
    O_RDONLY = libc::O_RDONLY,
    /// Open file for writing only.
    O_WRONLY = libc::O_WRONLY,
    /// Open file for reading and writing.
    O_RDWR = libc::O_RDWR,
}

/// Open flags as passed to open operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpenFlags(pub i32);

impl LowerHex for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

impl UpperHex for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        UpperHex::fmt(&self.0, f)
    }
}

impl OpenFlags {
    /// File access mode.
    pub fn acc_mode(self) -> OpenAccMode {
        match self.0 & libc::O_ACCMODE {
            libc::O_RDONLY => OpenAccMode::O_RDONLY,
            libc::O_WRONLY => OpenAccMode::O_WRONLY,
            libc::O_RDWR => OpenAccMode::O_RDWR,
            _ => {
                // Impossible combination of flags.
                // Do not panic because the field is public.
                OpenAccMode::O_RDONLY
            }
        }
    }

    /// Whether the open requests any form of write access.
    pub fn is_write(self) -> bool {
        matches!(self.acc_mode(), OpenAccMode::O_WRONLY | OpenAccMode::O_RDWR)
    }

    /// Whether `O_CREAT` is set.
    pub fn is_create(self) -> bool {
        self.0 & libc::O_CREAT != 0
    }

    /// Whether `O_TRUNC` is set.
    pub fn is_trunc(self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }

    /// The short token LazyOpen embeds in `eos.client.openflags`: `"ro"`,
    /// `"wo"`, or `"rw"`, with `"cr"` and/or `"tr"` appended.
    pub fn to_open_token(self) -> String {
        let mut token = match self.acc_mode() {
            OpenAccMode::O_RDONLY => "ro".to_string(),
            OpenAccMode::O_WRONLY => "wo".to_string(),
            OpenAccMode::O_RDWR => "rw".to_string(),
        };
        if self.is_create() {
            token.push_str("cr");
        }
        if self.is_trunc() {
            token.push_str("tr");
        }
        token
    }

    /// Clear `O_CREAT` and `O_TRUNC`, as LazyOpen/the synchronous open do
    /// once the first open for a handle has gone through, so a later
    /// `make_open` never re-truncates.
    pub fn without_create_trunc(self) -> OpenFlags {
        OpenFlags(self.0 & !(libc::O_CREAT | libc::O_TRUNC))
    }
}
