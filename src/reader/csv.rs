use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use csv::StringRecordsIntoIter;

use crate::error::{Error, Result};
use crate::model::bounds::Bounds;
use crate::model::point::Point;
use crate::model::schema::{DimType, Schema};
use crate::reader::{BatchIter, PointBatch, Preview, Reader, Reprojection};

const BATCH_ROWS: usize = 4096;

// Delimited text input: one point per row, dimensions matched to columns by
// header name.  Coordinates are taken as already being in the project
// system; there is nothing in a csv to reproject from.
pub struct CsvReader;

impl CsvReader {
	pub fn new() -> CsvReader {
		CsvReader
	}
}

impl Default for CsvReader {
	fn default() -> CsvReader {
		CsvReader::new()
	}
}

fn write_value(data: &mut [u8], r#type: DimType, v: f64) {
	match r#type {
		DimType::Int8 => data[0] = v as i8 as u8,
		DimType::Uint8 => data[0] = v as u8,
		DimType::Int16 => LittleEndian::write_i16(data, v as i16),
		DimType::Uint16 => LittleEndian::write_u16(data, v as u16),
		DimType::Int32 => LittleEndian::write_i32(data, v as i32),
		DimType::Uint32 => LittleEndian::write_u32(data, v as u32),
		DimType::Int64 => LittleEndian::write_i64(data, v as i64),
		DimType::Uint64 => LittleEndian::write_u64(data, v as u64),
		DimType::Float => LittleEndian::write_f32(data, v as f32),
		DimType::Double => LittleEndian::write_f64(data, v),
	}
}

struct Columns {
	// Per schema dimension: source column, byte offset, type, width.
	mapped: Vec<(usize, usize, DimType, usize)>,
	xyz: [usize; 3],
}

fn map_columns(headers: &csv::StringRecord, schema: &Schema) -> Result<Columns> {
	let position = |name: &str| {
		headers
			.iter()
			.position(|h| h.trim().eq_ignore_ascii_case(name))
	};

	let mut mapped = Vec::new();
	let mut at = 0;
	for dim in schema.dims() {
		if let Some(col) = position(&dim.name) {
			mapped.push((col, at, dim.r#type, dim.size()));
		}
		at += dim.size();
	}

	let xyz = ["x", "y", "z"].map(|name| position(name));
	match xyz {
		[Some(x), Some(y), Some(z)] => Ok(Columns {
			mapped,
			xyz: [x, y, z],
		}),
		_ => Err(Error::Schema("csv lacks x/y/z columns".to_string())),
	}
}

struct CsvBatches {
	path: String,
	records: StringRecordsIntoIter<std::fs::File>,
	columns: Columns,
	point_size: usize,
	done: bool,
}

impl CsvBatches {
	fn parse(&self, record: &csv::StringRecord, row: &mut [u8]) -> Result<()> {
		row.fill(0);
		for (col, at, r#type, width) in &self.columns.mapped {
			let field = record.get(*col).unwrap_or("");
			let v: f64 = field.trim().parse().map_err(|_| {
				Error::Read(self.path.clone(), format!("bad value {:?}", field))
			})?;
			write_value(&mut row[*at..*at + *width], *r#type, v);
		}
		Ok(())
	}
}

impl Iterator for CsvBatches {
	type Item = Result<PointBatch>;

	fn next(&mut self) -> Option<Result<PointBatch>> {
		if self.done {
			return None;
		}

		let mut batch = PointBatch::new(self.point_size);
		let mut row = vec![0u8; self.point_size];

		while batch.len() < BATCH_ROWS {
			match self.records.next() {
				Some(Ok(record)) => {
					if let Err(e) = self.parse(&record, &mut row) {
						self.done = true;
						return Some(Err(e));
					}
					batch.push(&row);
				}
				Some(Err(e)) => {
					self.done = true;
					return Some(Err(Error::Read(self.path.clone(), e.to_string())));
				}
				None => {
					self.done = true;
					break;
				}
			}
		}

		if batch.is_empty() {
			None
		} else {
			Some(Ok(batch))
		}
	}
}

impl Reader for CsvReader {
	fn good(&self, path: &Path) -> bool {
		path.extension()
			.and_then(|e| e.to_str())
			.map(|e| e.eq_ignore_ascii_case("csv"))
			.unwrap_or(false)
	}

	// csv carries no header block, so only a deep preview can answer.
	fn preview(
		&self,
		path: &Path,
		_reprojection: Option<&Reprojection>,
		deep: bool,
	) -> Option<Preview> {
		if !deep {
			return None;
		}

		let mut reader = csv::Reader::from_path(path).ok()?;
		let headers = reader.headers().ok()?.clone();
		let dim_names: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();

		let xyz = ["x", "y", "z"].map(|name| {
			headers
				.iter()
				.position(|h| h.trim().eq_ignore_ascii_case(name))
		});
		let [Some(x), Some(y), Some(z)] = xyz else {
			return None;
		};

		let mut bounds = Bounds::expander(true);
		let mut num_points = 0;
		for record in reader.records() {
			let record = record.ok()?;
			let field = |i: usize| record.get(i).unwrap_or("").trim().parse::<f64>().ok();
			let p = Point::new(field(x)?, field(y)?, field(z)?);
			bounds.grow(&p);
			num_points += 1;
		}

		Some(Preview {
			num_points,
			bounds: (num_points > 0).then_some(bounds),
			srs: String::new(),
			dim_names,
			scale: None,
		})
	}

	fn read(
		&self,
		path: &Path,
		_reprojection: Option<&Reprojection>,
		schema: &Schema,
	) -> Result<BatchIter> {
		let display = path.display().to_string();
		let mut reader = csv::Reader::from_path(path)
			.map_err(|e| Error::Read(display.clone(), e.to_string()))?;
		let headers = reader
			.headers()
			.map_err(|e| Error::Read(display.clone(), e.to_string()))?
			.clone();

		let columns = map_columns(&headers, schema)?;

		Ok(Box::new(CsvBatches {
			path: display,
			records: reader.into_records(),
			columns,
			point_size: schema.point_size(),
			done: false,
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::schema::Dimension;
	use std::io::Write;
	use tempfile::tempdir;

	fn write_fixture(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
		let path = dir.join(name);
		let mut f = std::fs::File::create(&path).unwrap();
		f.write_all(body.as_bytes()).unwrap();
		path
	}

	#[test]
	fn test_good_checks_extension() {
		let reader = CsvReader::new();
		assert!(reader.good(Path::new("points.csv")));
		assert!(reader.good(Path::new("points.CSV")));
		assert!(!reader.good(Path::new("points.laz")));
		assert!(!reader.good(Path::new("points")));
	}

	#[test]
	fn test_read_packs_schema_rows() {
		let dir = tempdir().unwrap();
		let path = write_fixture(
			dir.path(),
			"pts.csv",
			"x,y,z,intensity\n1.0,2.0,3.0,7\n4.0,5.0,6.0,8\n",
		);

		let schema = Schema::with_origin(vec![
			Dimension::new("X", DimType::Double),
			Dimension::new("Y", DimType::Double),
			Dimension::new("Z", DimType::Double),
			Dimension::new("Intensity", DimType::Uint16),
		])
		.unwrap();

		let reader = CsvReader::new();
		let batches: Vec<_> = reader
			.read(&path, None, &schema)
			.unwrap()
			.collect::<Result<Vec<_>>>()
			.unwrap();

		assert_eq!(batches.len(), 1);
		let batch = &batches[0];
		assert_eq!(batch.len(), 2);

		let rows: Vec<&[u8]> = batch.rows().collect();
		assert_eq!(schema.point(rows[0]), Point::new(1.0, 2.0, 3.0));
		assert_eq!(schema.point(rows[1]), Point::new(4.0, 5.0, 6.0));

		let at = schema.offset("Intensity").unwrap();
		assert_eq!(LittleEndian::read_u16(&rows[1][at..]), 8);
		// Origin is left unstamped for the build loop to fill.
		assert_eq!(schema.origin(rows[0]), 0);
	}

	#[test]
	fn test_deep_preview_counts_and_bounds() {
		let dir = tempdir().unwrap();
		let path = write_fixture(dir.path(), "pts.csv", "x,y,z\n0,0,0\n10,4,-2\n5,5,5\n");

		let reader = CsvReader::new();
		let preview = reader.preview(&path, None, true).unwrap();
		assert_eq!(preview.num_points, 3);

		let bounds = preview.bounds.unwrap();
		assert_eq!(bounds.min, Point::new(0.0, 0.0, -2.0));
		assert_eq!(bounds.max, Point::new(10.0, 5.0, 5.0));

		// Shallow previews cannot answer for csv.
		assert!(reader.preview(&path, None, false).is_none());
	}

	#[test]
	fn test_bad_value_surfaces_read_error() {
		let dir = tempdir().unwrap();
		let path = write_fixture(dir.path(), "pts.csv", "x,y,z\n1,2,3\nnope,2,3\n");

		let schema = Schema::xyz();
		let reader = CsvReader::new();
		let results: Vec<_> = reader.read(&path, None, &schema).unwrap().collect();

		// One batch carries the error; iteration fuses after it.
		assert!(results.iter().any(|r| r.is_err()));
	}
}
