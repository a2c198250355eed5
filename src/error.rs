use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("not found: {0}")]
	NotFound(String),

	#[error(transparent)]
	Io(#[from] io::Error),

	#[error("invalid metadata: {0}")]
	Metadata(#[from] serde_json::Error),

	#[error("invalid structure: {0}")]
	Structure(String),

	#[error("invalid configuration: {0}")]
	Config(String),

	#[error("invalid schema: {0}")]
	Schema(String),

	#[error("invalid scale for {0}")]
	InvalidScale(String),

	#[error("no points found")]
	NoPoints,

	#[error("tmp path must be local")]
	RemoteTmp,

	#[error("cannot merge: {0}")]
	Merge(String),

	#[error("malformed chunk {0}: {1}")]
	Chunk(u64, String),

	#[error("read failure for {0}: {1}")]
	Read(String, String),
}
