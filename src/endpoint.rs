use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// Keyed blob store the index is written through.  Implementations over
// remote object stores plug in here; the directory-backed endpoint below
// covers local builds, tmp space, and tests.
pub trait Endpoint: Send + Sync {
	fn get(&self, key: &str) -> Result<Vec<u8>>;
	fn put(&self, key: &str, data: &[u8]) -> Result<()>;
	fn get_range(&self, key: &str, lo: u64, hi: u64) -> Result<Vec<u8>>;
	fn is_local(&self) -> bool;
	fn root(&self) -> &Path;
}

pub struct DirEndpoint {
	root: PathBuf,
}

impl DirEndpoint {
	pub fn new(root: &Path) -> DirEndpoint {
		DirEndpoint {
			root: root.to_path_buf(),
		}
	}

	fn full_path(&self, key: &str) -> PathBuf {
		self.root.join(key)
	}
}

impl Endpoint for DirEndpoint {
	fn get(&self, key: &str) -> Result<Vec<u8>> {
		match fs::read(self.full_path(key)) {
			Ok(data) => Ok(data),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				Err(Error::NotFound(key.to_string()))
			}
			Err(e) => Err(e.into()),
		}
	}

	fn put(&self, key: &str, data: &[u8]) -> Result<()> {
		// Write-then-rename so readers never observe a partial value.
		let path = self.full_path(key);
		let staged = self.full_path(&format!(".{}.partial", key));

		fs::write(&staged, data)?;
		fs::rename(&staged, &path)?;
		Ok(())
	}

	fn get_range(&self, key: &str, lo: u64, hi: u64) -> Result<Vec<u8>> {
		let mut file = match fs::File::open(self.full_path(key)) {
			Ok(file) => file,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(Error::NotFound(key.to_string()));
			}
			Err(e) => return Err(e.into()),
		};

		file.seek(SeekFrom::Start(lo))?;
		let mut data = vec![0u8; (hi - lo) as usize];
		let mut at = 0;
		while at < data.len() {
			let n = file.read(&mut data[at..])?;
			if n == 0 {
				break;
			}
			at += n;
		}
		data.truncate(at);
		Ok(data)
	}

	fn is_local(&self) -> bool {
		true
	}

	fn root(&self) -> &Path {
		&self.root
	}
}

pub fn mkdirp(path: &Path) -> Result<()> {
	fs::create_dir_all(path)?;
	Ok(())
}

// A locally readable copy of an input.  Files staged into tmp space are
// deleted when the handle drops; files that were already local are not.
pub struct LocalHandle {
	path: PathBuf,
	owned: bool,
}

impl LocalHandle {
	pub fn borrowed(path: &Path) -> LocalHandle {
		LocalHandle {
			path: path.to_path_buf(),
			owned: false,
		}
	}

	pub fn staged(path: PathBuf) -> LocalHandle {
		LocalHandle { path, owned: true }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for LocalHandle {
	fn drop(&mut self) {
		if self.owned {
			let _ = fs::remove_file(&self.path);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn test_put_get() {
		let dir = tempdir().unwrap();
		let ep = DirEndpoint::new(dir.path());

		ep.put("42", b"hello").unwrap();
		assert_eq!(ep.get("42").unwrap(), b"hello");
	}

	#[test]
	fn test_get_missing() {
		let dir = tempdir().unwrap();
		let ep = DirEndpoint::new(dir.path());

		match ep.get("nope") {
			Err(Error::NotFound(key)) => assert_eq!(key, "nope"),
			other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn test_get_range() {
		let dir = tempdir().unwrap();
		let ep = DirEndpoint::new(dir.path());

		ep.put("blob", b"0123456789").unwrap();
		assert_eq!(ep.get_range("blob", 2, 5).unwrap(), b"234");
		// Ranges past the end are truncated, not errors.
		assert_eq!(ep.get_range("blob", 8, 100).unwrap(), b"89");
	}

	#[test]
	fn test_overwrite_is_atomic_at_rest() {
		let dir = tempdir().unwrap();
		let ep = DirEndpoint::new(dir.path());

		ep.put("k", b"first").unwrap();
		ep.put("k", b"second").unwrap();
		assert_eq!(ep.get("k").unwrap(), b"second");
		// No staging residue.
		assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
	}
}
