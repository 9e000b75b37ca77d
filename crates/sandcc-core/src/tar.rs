//! ustar archive reader
//!
//! Only what the sysroot archive needs: regular files and directories. The
//! archive is trusted input, so anything else is a hard error rather than
//! something to skip.

use crate::{Result, SandccError};

const BLOCK: usize = 512;

/// Type flag of a tar header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Other(u8),
}

impl From<u8> for EntryKind {
    fn from(flag: u8) -> Self {
        match flag {
            b'0' => Self::Regular,
            b'5' => Self::Directory,
            other => Self::Other(other),
        }
    }
}

/// One parsed header plus, for regular files, a slice of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry<'a> {
    pub filename: String,
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: u64,
    pub checksum: u64,
    pub kind: EntryKind,
    pub link_name: String,
    pub owner_name: String,
    pub group_name: String,
    pub dev_major: String,
    pub dev_minor: String,
    pub filename_prefix: String,
    pub contents: Option<&'a [u8]>,
}

impl TarEntry<'_> {
    /// Full path of the entry, without a trailing slash.
    #[must_use]
    pub fn path(&self) -> String {
        let path = if self.filename_prefix.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.filename_prefix, self.filename)
        };
        path.trim_end_matches('/').to_owned()
    }
}

/// Receives extracted entries.
pub trait VfsSink {
    fn add_directory(&mut self, path: &str) -> Result<()>;
    fn add_file(&mut self, path: &str, contents: &[u8]) -> Result<()>;
}

/// Forward-only reader over an in-memory archive.
#[derive(Debug)]
pub struct TarReader<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> TarReader<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            done: false,
        }
    }

    /// Parse the next header. `Ok(None)` marks the end of the archive: fewer
    /// than one block left, or a block whose magic is not `ustar` (which is
    /// also how the zero-filled trailer blocks end the sequence).
    pub fn parse_next(&mut self) -> Result<Option<TarEntry<'a>>> {
        if self.done {
            return Ok(None);
        }
        let Some(header) = self.data.get(self.offset..self.offset + BLOCK) else {
            self.done = true;
            return Ok(None);
        };
        if &header[257..262] != b"ustar" {
            self.done = true;
            return Ok(None);
        }

        let mut entry = TarEntry {
            filename: text(&header[0..100]),
            mode: octal(&header[100..108], "mode")?,
            uid: octal(&header[108..116], "uid")?,
            gid: octal(&header[116..124], "gid")?,
            size: octal(&header[124..136], "size")?,
            mtime: octal(&header[136..148], "mtime")?,
            checksum: octal(&header[148..156], "checksum")?,
            kind: EntryKind::from(header[156]),
            link_name: text(&header[157..257]),
            owner_name: text(&header[265..297]),
            group_name: text(&header[297..329]),
            dev_major: text(&header[329..337]),
            dev_minor: text(&header[337..345]),
            filename_prefix: text(&header[345..500]),
            contents: None,
        };
        self.offset += BLOCK;

        if entry.kind != EntryKind::Directory {
            let size = usize::try_from(entry.size)
                .map_err(|_| SandccError::Archive(format!("entry too large: {}", entry.size)))?;
            let body = self
                .data
                .get(self.offset..self.offset + size)
                .ok_or_else(|| {
                    SandccError::Archive(format!(
                        "'{}' claims {} bytes but the archive ends first",
                        entry.path(),
                        size
                    ))
                })?;
            if entry.kind == EntryKind::Regular {
                entry.contents = Some(body);
            }
            self.offset += size.div_ceil(BLOCK) * BLOCK;
        }

        Ok(Some(entry))
    }
}

impl<'a> Iterator for TarReader<'a> {
    type Item = Result<TarEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.parse_next() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for TarReader<'_> {}

/// Extract every entry of `archive` into `sink`, returning how many were added.
pub fn extract_into<S: VfsSink + ?Sized>(archive: &[u8], sink: &mut S) -> Result<usize> {
    let mut count = 0;
    for entry in TarReader::new(archive) {
        let entry = entry?;
        let path = entry.path();
        match (entry.kind, entry.contents) {
            (EntryKind::Directory, _) => sink.add_directory(&path)?,
            (EntryKind::Regular, Some(contents)) => sink.add_file(&path, contents)?,
            (kind, _) => {
                let flag = match kind {
                    EntryKind::Other(flag) => flag,
                    EntryKind::Regular => b'0',
                    EntryKind::Directory => b'5',
                };
                return Err(SandccError::UnsupportedEntry {
                    path,
                    kind: char::from(flag),
                });
            }
        }
        count += 1;
    }
    tracing::debug!(entries = count, "archive extracted");
    Ok(count)
}

fn text(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn octal(field: &[u8], name: &str) -> Result<u64> {
    let digits = text(field);
    let digits = digits.trim_matches(|c: char| c == ' ' || c == '\0');
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 8)
        .map_err(|_| SandccError::Archive(format!("bad octal in {name} field: {digits:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        dirs: Vec<String>,
        files: Vec<(String, Vec<u8>)>,
    }

    impl VfsSink for Recorder {
        fn add_directory(&mut self, path: &str) -> Result<()> {
            self.dirs.push(path.to_owned());
            Ok(())
        }

        fn add_file(&mut self, path: &str, contents: &[u8]) -> Result<()> {
            self.files.push((path.to_owned(), contents.to_vec()));
            Ok(())
        }
    }

    fn archive(entries: &[(&str, ::tar::EntryType, &[u8])]) -> Vec<u8> {
        let mut builder = ::tar::Builder::new(Vec::new());
        for (path, kind, data) in entries {
            let mut header = ::tar::Header::new_ustar();
            header.set_path(path).unwrap();
            header.set_entry_type(*kind);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_files_and_directories() {
        let data = archive(&[
            ("include", ::tar::EntryType::Directory, &b""[..]),
            ("include/stdio.h", ::tar::EntryType::Regular, &b"int puts(const char*);\n"[..]),
            ("lib/wasm32-wasi/crt1.o", ::tar::EntryType::Regular, &[0u8; 700][..]),
            ("empty.txt", ::tar::EntryType::Regular, &b""[..]),
        ]);

        let mut sink = Recorder::default();
        let count = extract_into(&data, &mut sink).unwrap();

        assert_eq!(count, 4);
        assert_eq!(sink.dirs, vec!["include"]);
        assert_eq!(sink.files[0].0, "include/stdio.h");
        assert_eq!(sink.files[0].1, &b"int puts(const char*);\n"[..]);
        assert_eq!(sink.files[1].1.len(), 700);
        assert_eq!(sink.files[2], ("empty.txt".to_owned(), Vec::new()));
    }

    #[test]
    fn header_fields_are_decoded() {
        let data = archive(&[("hello.txt", ::tar::EntryType::Regular, &b"hi"[..])]);
        let entry = TarReader::new(&data).parse_next().unwrap().unwrap();

        assert_eq!(entry.filename, "hello.txt");
        assert_eq!(entry.mode, 0o644);
        assert_eq!(entry.size, 2);
        assert_eq!(entry.mtime, 1_700_000_000);
        assert_eq!(entry.kind, EntryKind::Regular);
        assert_eq!(entry.contents, Some(&b"hi"[..]));
        assert_ne!(entry.checksum, 0);
    }

    #[test]
    fn sequence_is_fused_after_the_trailer() {
        let data = archive(&[("a", ::tar::EntryType::Regular, &b"1"[..])]);
        let mut reader = TarReader::new(&data);
        assert!(reader.parse_next().unwrap().is_some());
        assert!(reader.parse_next().unwrap().is_none());
        assert!(reader.parse_next().unwrap().is_none());
    }

    #[test]
    fn short_or_foreign_input_is_an_empty_archive() {
        assert_eq!(TarReader::new(&[0u8; 100]).count(), 0);
        assert_eq!(TarReader::new(&[0u8; 1024]).count(), 0);
    }

    #[test]
    fn symlinks_are_fatal() {
        let mut builder = ::tar::Builder::new(Vec::new());
        let mut header = ::tar::Header::new_ustar();
        header.set_path("lib/libc.so").unwrap();
        header.set_link_name("libc.a").unwrap();
        header.set_entry_type(::tar::EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, &[][..]).unwrap();
        let data = builder.into_inner().unwrap();

        let err = extract_into(&data, &mut Recorder::default()).unwrap_err();
        assert!(matches!(
            err,
            SandccError::UnsupportedEntry { ref path, kind: '2' } if path == "lib/libc.so"
        ));
    }

    #[test]
    fn truncated_body_is_an_archive_error() {
        let mut data = archive(&[("big", ::tar::EntryType::Regular, &[7u8; 2000][..])]);
        data.truncate(BLOCK + 100);
        let err = extract_into(&data, &mut Recorder::default()).unwrap_err();
        assert!(matches!(err, SandccError::Archive(_)));
    }

    #[test]
    fn prefix_is_joined_for_long_paths() {
        let long_dir = "include/".repeat(15);
        let path = format!("{long_dir}deep.h");
        let data = archive(&[(&path, ::tar::EntryType::Regular, &b"x"[..])]);

        let mut sink = Recorder::default();
        extract_into(&data, &mut sink).unwrap();
        assert_eq!(sink.files[0].0, path);
    }
}
