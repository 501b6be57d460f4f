use super::descriptor::{BytesWithImageDescriptor, FrameError, ImageDescriptor};
use bytes::Bytes;

/// RLE Lossless transfer syntax UID.
pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";

/// Extracts frame `index` from `source`:
/// - Native (uncompressed) sources are sliced into aligned, fixed-size
///   frames out of the single concatenated sample buffer.
/// - A single-frame encapsulated source (any JPEG-family syntax with
///   `descriptor.frames == 1`) is every remaining fragment (the Basic Offset
///   Table already excluded) concatenated, regardless of how many fragments
///   the frame was split across on the wire.
/// - RLE Lossless encodes one frame per fragment (fragment 0 is never a
///   frame; frame `i` is fragment `i + 1`).
/// - Other encapsulated, multi-frame (JPEG-family) sources are split at
///   fragment boundaries discovered by a JPEG SOI/EOI scan; the scan must
///   discover exactly `descriptor.frames` start points or extraction fails.
pub fn extract_frame(
	source: &dyn BytesWithImageDescriptor,
	index: u32,
) -> Result<Bytes, FrameError> {
	let descriptor = source.image_descriptor();
	let fragments = source.fragments();

	if super::is_native(source.transfer_syntax()) {
		return extract_native_frame(fragments.first(), &descriptor, index);
	}

	if source.transfer_syntax() == RLE_LOSSLESS {
		let fragment_index = index as usize + 1;
		return fragments
			.get(fragment_index)
			.cloned()
			.ok_or(FrameError::OutOfStreamLimit);
	}

	if descriptor.frames == 1 {
		if index != 0 {
			return Err(FrameError::OutOfStreamLimit);
		}
		if fragments.is_empty() {
			return Err(FrameError::OutOfStreamLimit);
		}
		if fragments.len() == 1 {
			return Ok(fragments[0].clone());
		}
		let mut combined = Vec::new();
		for fragment in fragments {
			combined.extend_from_slice(fragment);
		}
		return Ok(Bytes::from(combined));
	}

	extract_jpeg_frame(fragments, &descriptor, index)
}

fn extract_native_frame(
	concatenated: Option<&Bytes>,
	descriptor: &ImageDescriptor,
	index: u32,
) -> Result<Bytes, FrameError> {
	let concatenated = concatenated.ok_or(FrameError::OutOfStreamLimit)?;
	let frame_length = descriptor.frame_length();
	let start = frame_length * index as usize;
	let end = start + frame_length;

	if end > concatenated.len() {
		return Err(FrameError::OutOfStreamLimit);
	}

	Ok(concatenated.slice(start..end))
}

/// Discovers JPEG frame boundaries across `fragments` by checking which
/// fragments begin a standalone JPEG bitstream (a fragment that itself
/// parses as a complete SOI..EOI image is a frame start; a fragment that
/// continues a previous frame does not). If the number of discovered starts
/// does not equal `descriptor.frames`, the fragments cannot be unambiguously
/// matched to frames.
fn extract_jpeg_frame(
	fragments: &[Bytes],
	descriptor: &ImageDescriptor,
	index: u32,
) -> Result<Bytes, FrameError> {
	let frame_starts: Vec<usize> = fragments
		.iter()
		.enumerate()
		.filter(|(_, fragment)| is_jpeg_frame_start(fragment))
		.map(|(i, _)| i)
		.collect();

	if frame_starts.len() != descriptor.frames as usize {
		return Err(FrameError::FragmentMismatch);
	}

	let frame_index = index as usize;
	let start = *frame_starts.get(frame_index).ok_or(FrameError::OutOfStreamLimit)?;
	let end = frame_starts
		.get(frame_index + 1)
		.copied()
		.unwrap_or(fragments.len());

	if end - start == 1 {
		return Ok(fragments[start].clone());
	}

	let mut combined = Vec::new();
	for fragment in &fragments[start..end] {
		combined.extend_from_slice(fragment);
	}
	Ok(Bytes::from(combined))
}

/// A JPEG bitstream fragment starts a new frame if it begins with a Start
/// Of Image marker (`0xFFD8`) and contains a matching End Of Image marker
/// (`0xFFD9`); a continuation fragment (the tail of a frame that was split
/// across PDVs) does neither.
fn is_jpeg_frame_start(fragment: &[u8]) -> bool {
	const SOI: [u8; 2] = [0xFF, 0xD8];
	const EOI: [u8; 2] = [0xFF, 0xD9];

	fragment.len() >= 4
		&& fragment[0..2] == SOI
		&& fragment.windows(2).any(|window| window == EOI)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transcoder::descriptor::PhotometricInterpretation;

	fn descriptor(frames: u32) -> ImageDescriptor {
		ImageDescriptor {
			rows: 2,
			columns: 2,
			samples_per_pixel: 1,
			bits_allocated: 8,
			bits_stored: 8,
			frames,
			photometric_interpretation: PhotometricInterpretation::Monochrome2,
		}
	}

	struct Source {
		descriptor: ImageDescriptor,
		transfer_syntax: String,
		fragments: Vec<Bytes>,
	}

	impl BytesWithImageDescriptor for Source {
		fn image_descriptor(&self) -> ImageDescriptor {
			self.descriptor
		}
		fn transfer_syntax(&self) -> &str {
			&self.transfer_syntax
		}
		fn fragments(&self) -> &[Bytes] {
			&self.fragments
		}
		fn palette_color_lookup_table(&self) -> Option<&dicom::object::InMemDicomObject> {
			None
		}
	}

	#[test]
	fn native_frame_is_an_aligned_slice() {
		let source = Source {
			descriptor: descriptor(2),
			transfer_syntax: String::from("1.2.840.10008.1.2.1"),
			fragments: vec![Bytes::from_static(&[0, 1, 2, 3, 4, 5, 6, 7])],
		};
		assert_eq!(
			extract_frame(&source, 0).unwrap(),
			Bytes::from_static(&[0, 1, 2, 3])
		);
		assert_eq!(
			extract_frame(&source, 1).unwrap(),
			Bytes::from_static(&[4, 5, 6, 7])
		);
	}

	#[test]
	fn native_frame_out_of_range_is_an_error() {
		let source = Source {
			descriptor: descriptor(1),
			transfer_syntax: String::from("1.2.840.10008.1.2.1"),
			fragments: vec![Bytes::from_static(&[0, 1, 2, 3])],
		};
		assert!(matches!(
			extract_frame(&source, 5),
			Err(FrameError::OutOfStreamLimit)
		));
	}

	#[test]
	fn rle_maps_fragment_i_plus_one_to_frame_i() {
		let source = Source {
			descriptor: descriptor(2),
			transfer_syntax: String::from(RLE_LOSSLESS),
			fragments: vec![
				Bytes::from_static(b"offset-table"),
				Bytes::from_static(b"frame-0"),
				Bytes::from_static(b"frame-1"),
			],
		};
		assert_eq!(extract_frame(&source, 0).unwrap(), Bytes::from_static(b"frame-0"));
		assert_eq!(extract_frame(&source, 1).unwrap(), Bytes::from_static(b"frame-1"));
	}

	#[test]
	fn single_frame_encapsulated_concatenates_all_fragments() {
		let source = Source {
			descriptor: descriptor(1),
			transfer_syntax: String::from("1.2.840.10008.1.2.4.50"),
			fragments: vec![Bytes::from_static(b"part-a"), Bytes::from_static(b"part-b")],
		};
		assert_eq!(extract_frame(&source, 0).unwrap(), Bytes::from_static(b"part-apart-b"));
	}

	#[test]
	fn single_frame_encapsulated_single_fragment_is_returned_whole() {
		let source = Source {
			descriptor: descriptor(1),
			transfer_syntax: String::from("1.2.840.10008.1.2.4.50"),
			fragments: vec![Bytes::from_static(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9])],
		};
		assert_eq!(
			extract_frame(&source, 0).unwrap(),
			Bytes::from_static(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9])
		);
	}

	#[test]
	fn jpeg_fragments_match_one_start_per_frame() {
		let mut frame0 = vec![0xFF, 0xD8];
		frame0.extend_from_slice(b"data");
		frame0.extend_from_slice(&[0xFF, 0xD9]);
		let mut frame1 = vec![0xFF, 0xD8];
		frame1.extend_from_slice(b"more");
		frame1.extend_from_slice(&[0xFF, 0xD9]);

		let source = Source {
			descriptor: descriptor(2),
			transfer_syntax: String::from("1.2.840.10008.1.2.4.50"),
			fragments: vec![Bytes::from(frame0.clone()), Bytes::from(frame1.clone())],
		};
		assert_eq!(extract_frame(&source, 0).unwrap(), Bytes::from(frame0));
		assert_eq!(extract_frame(&source, 1).unwrap(), Bytes::from(frame1));
	}

	#[test]
	fn jpeg_fragment_count_mismatch_fails() {
		let source = Source {
			descriptor: descriptor(2),
			transfer_syntax: String::from("1.2.840.10008.1.2.4.50"),
			fragments: vec![Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9])],
		};
		assert!(matches!(
			extract_frame(&source, 0),
			Err(FrameError::FragmentMismatch)
		));
	}
}
