use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::SystemTime;

use super::{ChannelWriter, DirEntry, FileChannel, FileStat};

/// Buffer size for local file I/O (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// [`FileChannel`] over the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalChannel;

impl LocalChannel {
    pub fn new() -> Self {
        Self
    }
}

fn to_stat(metadata: &fs::Metadata) -> FileStat {
    FileStat {
        size: metadata.len(),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        is_file: metadata.is_file(),
        is_dir: metadata.is_dir(),
    }
}

struct LocalWriter {
    inner: BufWriter<File>,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ChannelWriter for LocalWriter {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.get_ref().sync_data()
    }
}

impl FileChannel for LocalChannel {
    fn stat(&mut self, path: &Path) -> io::Result<Option<FileStat>> {
        match fs::metadata(path) {
            Ok(m) => Ok(Some(to_stat(&m))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&mut self, dir: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            // symlink_metadata so links are never mistaken for artifacts
            let metadata = match path.symlink_metadata() {
                Ok(m) => m,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            entries.push(DirEntry {
                path,
                stat: to_stat(&metadata),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn open_read(&mut self, path: &Path, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        let mut file = File::open(path)?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(Box::new(BufReader::with_capacity(BUFFER_SIZE, file)))
    }

    fn open_write(&mut self, path: &Path, offset: u64) -> io::Result<Box<dyn ChannelWriter>> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(LocalWriter {
            inner: BufWriter::with_capacity(BUFFER_SIZE, file),
        }))
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn create_dir_all(&mut self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn set_modified(&mut self, path: &Path, modified: DateTime<Utc>) -> io::Result<()> {
        let mtime = filetime::FileTime::from_system_time(SystemTime::from(modified));
        filetime::set_file_mtime(path, mtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stat_of_missing_file_is_none() {
        let temp = tempdir().unwrap();
        let mut channel = LocalChannel::new();
        assert!(channel.stat(&temp.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn open_write_truncates_to_offset() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("partial.bin");
        fs::write(&path, b"0123456789").unwrap();

        let mut channel = LocalChannel::new();
        let mut writer = channel.open_write(&path, 4).unwrap();
        writer.write_all(b"ab").unwrap();
        writer.sync().unwrap();
        drop(writer);

        assert_eq!(fs::read(&path).unwrap(), b"0123ab");
    }

    #[test]
    fn open_read_starts_at_offset() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("src.bin");
        fs::write(&path, b"hello world").unwrap();

        let mut channel = LocalChannel::new();
        let mut reader = channel.open_read(&path, 6).unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "world");
    }

    #[test]
    fn list_is_sorted_and_skips_nothing_regular() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("b.tar"), b"b").unwrap();
        fs::write(temp.path().join("a.tar"), b"a").unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();

        let mut channel = LocalChannel::new();
        let entries = channel.list(temp.path()).unwrap();
        let names: Vec<_> = entries.iter().filter_map(|e| e.file_name()).collect();
        assert_eq!(names, vec!["a.tar", "b.tar", "sub"]);
        assert!(entries[2].stat.is_dir);
    }

    #[test]
    fn remove_missing_is_ok() {
        let temp = tempdir().unwrap();
        let mut channel = LocalChannel::new();
        channel.remove(&temp.path().join("ghost")).unwrap();
    }
}
