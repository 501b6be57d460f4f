use bytes::Bytes;
use dicom::object::InMemDicomObject;
use thiserror::Error;

/// Static metadata about the pixel data behind a [`BytesWithImageDescriptor`].
#[derive(Debug, Clone, Copy)]
pub struct ImageDescriptor {
	pub rows: u16,
	pub columns: u16,
	pub samples_per_pixel: u16,
	pub bits_allocated: u16,
	pub bits_stored: u16,
	pub frames: u32,
	pub photometric_interpretation: PhotometricInterpretation,
}

impl ImageDescriptor {
	/// The byte length of a single aligned frame in a native (uncompressed)
	/// transfer syntax.
	pub const fn frame_length(&self) -> usize {
		let bytes_per_sample = (self.bits_allocated as usize).div_ceil(8);
		self.rows as usize * self.columns as usize * self.samples_per_pixel as usize * bytes_per_sample
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotometricInterpretation {
	Monochrome1,
	Monochrome2,
	PaletteColor,
	Rgb,
	YbrFull,
	YbrFull422,
	Other,
}

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("Frame out of the stream limit")]
	OutOfStreamLimit,
	#[error("Cannot match all the fragments to all the frames!")]
	FragmentMismatch,
}

/// A pluggable source of decoded-or-encapsulated frame bytes, matching
/// `BytesWithImageDescriptor`. Implementations wrap either a
/// native pixel data buffer or an encapsulated fragment sequence; frame
/// extraction logic (native slicing, RLE fragment mapping, JPEG SOI/EOI
/// discovery) lives in [`super::frames`] and is shared by every
/// implementation through the `raw_fragments`/`native_data` accessors.
pub trait BytesWithImageDescriptor: Send + Sync {
	fn image_descriptor(&self) -> ImageDescriptor;
	fn transfer_syntax(&self) -> &str;
	/// Pixel data fragments as they appear on the wire: a single element for
	/// native syntaxes (the whole concatenated sample stream), or one
	/// element per encapsulated fragment (the Basic Offset Table, if
	/// present, is excluded).
	fn fragments(&self) -> &[Bytes];
	fn palette_color_lookup_table(&self) -> Option<&InMemDicomObject>;
}

/// An in-memory [`BytesWithImageDescriptor`] built once per transfer, owning
/// its fragment bytes.
pub struct InMemoryFrameSource {
	pub descriptor: ImageDescriptor,
	pub transfer_syntax: String,
	pub fragments: Vec<Bytes>,
	pub palette_lut: Option<InMemDicomObject>,
}

impl BytesWithImageDescriptor for InMemoryFrameSource {
	fn image_descriptor(&self) -> ImageDescriptor {
		self.descriptor
	}

	fn transfer_syntax(&self) -> &str {
		&self.transfer_syntax
	}

	fn fragments(&self) -> &[Bytes] {
		&self.fragments
	}

	fn palette_color_lookup_table(&self) -> Option<&InMemDicomObject> {
		self.palette_lut.as_ref()
	}
}
