use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::point::Point;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimType {
	Int8,
	Int16,
	Int32,
	Int64,
	Uint8,
	Uint16,
	Uint32,
	Uint64,
	Float,
	Double,
}

impl DimType {
	pub fn size(&self) -> usize {
		match self {
			DimType::Int8 | DimType::Uint8 => 1,
			DimType::Int16 | DimType::Uint16 => 2,
			DimType::Int32 | DimType::Uint32 | DimType::Float => 4,
			DimType::Int64 | DimType::Uint64 | DimType::Double => 8,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
	pub name: String,
	pub r#type: DimType,
}

impl Dimension {
	pub fn new(name: &str, r#type: DimType) -> Dimension {
		Dimension {
			name: name.to_string(),
			r#type,
		}
	}

	pub fn size(&self) -> usize {
		self.r#type.size()
	}
}

// An ordered list of packed dimensions.  Every schema carries X/Y/Z doubles
// and the Origin stamp identifying the source file of each point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Dimension>", into = "Vec<Dimension>")]
pub struct Schema {
	dims: Vec<Dimension>,
	point_size: usize,
	x_offset: usize,
	y_offset: usize,
	z_offset: usize,
	origin_offset: usize,
}

impl Schema {
	pub fn new(dims: Vec<Dimension>) -> Result<Schema> {
		let offset = |name: &str| -> Result<usize> {
			let mut at = 0;
			for dim in &dims {
				if dim.name == name {
					return Ok(at);
				}
				at += dim.size();
			}
			Err(Error::Schema(format!("missing dimension {}", name)))
		};

		let x_offset = offset("X")?;
		let y_offset = offset("Y")?;
		let z_offset = offset("Z")?;
		let origin_offset = offset("Origin")?;

		let find = |name: &str| dims.iter().find(|d| d.name == name).unwrap();
		for name in ["X", "Y", "Z"] {
			if find(name).r#type != DimType::Double {
				return Err(Error::Schema(format!("{} must be a double", name)));
			}
		}
		if find("Origin").r#type != DimType::Uint32 {
			return Err(Error::Schema("Origin must be a uint32".to_string()));
		}

		let point_size = dims.iter().map(|d| d.size()).sum();

		Ok(Schema {
			dims,
			point_size,
			x_offset,
			y_offset,
			z_offset,
			origin_offset,
		})
	}

	// Appends the Origin dimension if the caller's list lacks one.
	pub fn with_origin(mut dims: Vec<Dimension>) -> Result<Schema> {
		if !dims.iter().any(|d| d.name == "Origin") {
			dims.push(Dimension::new("Origin", DimType::Uint32));
		}
		Schema::new(dims)
	}

	pub fn xyz() -> Schema {
		Schema::with_origin(vec![
			Dimension::new("X", DimType::Double),
			Dimension::new("Y", DimType::Double),
			Dimension::new("Z", DimType::Double),
		])
		.unwrap()
	}

	pub fn dims(&self) -> &[Dimension] {
		&self.dims
	}

	pub fn point_size(&self) -> usize {
		self.point_size
	}

	pub fn find(&self, name: &str) -> Option<&Dimension> {
		self.dims.iter().find(|d| d.name == name)
	}

	pub fn offset(&self, name: &str) -> Option<usize> {
		let mut at = 0;
		for dim in &self.dims {
			if dim.name == name {
				return Some(at);
			}
			at += dim.size();
		}
		None
	}

	// Dimension-wise union; dimensions already present keep their declared
	// type.
	pub fn merge(&self, other: &Schema) -> Schema {
		let mut dims = self.dims.clone();
		for dim in &other.dims {
			if !dims.iter().any(|d| d.name == dim.name) {
				dims.push(dim.clone());
			}
		}
		Schema::new(dims).expect("merge preserves required dimensions")
	}

	pub fn point(&self, data: &[u8]) -> Point {
		Point {
			x: LittleEndian::read_f64(&data[self.x_offset..]),
			y: LittleEndian::read_f64(&data[self.y_offset..]),
			z: LittleEndian::read_f64(&data[self.z_offset..]),
		}
	}

	pub fn set_point(&self, data: &mut [u8], p: &Point) {
		LittleEndian::write_f64(&mut data[self.x_offset..], p.x);
		LittleEndian::write_f64(&mut data[self.y_offset..], p.y);
		LittleEndian::write_f64(&mut data[self.z_offset..], p.z);
	}

	pub fn origin(&self, data: &[u8]) -> u32 {
		LittleEndian::read_u32(&data[self.origin_offset..])
	}

	pub fn set_origin(&self, data: &mut [u8], origin: u32) {
		LittleEndian::write_u32(&mut data[self.origin_offset..], origin);
	}
}

impl TryFrom<Vec<Dimension>> for Schema {
	type Error = Error;

	fn try_from(dims: Vec<Dimension>) -> Result<Schema> {
		Schema::new(dims)
	}
}

impl From<Schema> for Vec<Dimension> {
	fn from(schema: Schema) -> Vec<Dimension> {
		schema.dims
	}
}
