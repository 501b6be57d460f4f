//! The Transcoder: decides whether pixel data
//! needs to be re-encoded, and if so drives decode → mask → re-encode
//! through the external image library.

pub mod descriptor;
pub mod frames;

use crate::editor::MaskArea;
use crate::types::UI;
use bytes::Bytes;
use descriptor::{BytesWithImageDescriptor, ImageDescriptor, InMemoryFrameSource, PhotometricInterpretation};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom_pixeldata::PixelDecoder;
use thiserror::Error;

/// Implicit/Explicit VR Little/Big Endian: the three uncompressed
/// ("native") transfer syntaxes.
const NATIVE_TRANSFER_SYNTAXES: &[&str] = &[
	"1.2.840.10008.1.2",
	"1.2.840.10008.1.2.1",
	"1.2.840.10008.1.2.2",
];

/// RLE Lossless: never produced on output; any request
/// for it is substituted with Explicit VR Little Endian.
pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

/// JPEG Baseline (Process 1): the only JPEG-family bitstream the `image`
/// crate's encoder can actually produce.
pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

pub(crate) fn is_native(tsuid: &str) -> bool {
	NATIVE_TRANSFER_SYNTAXES.contains(&tsuid)
}

/// The `1.2.840.10008.1.2.4.10x` lossy video family (MPEG2/MPEG-4/HEVC).
fn is_lossy_video(tsuid: &str) -> bool {
	tsuid.starts_with("1.2.840.10008.1.2.4.10")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
	/// No recoding needed; the dataset can be written to the wire as-is.
	PassThrough,
	/// Decode, optionally mask, and re-encode to `target_tsuid`.
	Transcode { target_tsuid: UI },
}

/// Decides whether pixel data needs decoding/re-encoding, evaluated in order.
pub fn decide(
	has_pixel_data: bool,
	mask_set: bool,
	inbound_tsuid: &str,
	outbound_tsuid: &str,
) -> Decision {
	if !has_pixel_data {
		return Decision::PassThrough;
	}
	if mask_set && !is_lossy_video(inbound_tsuid) {
		return Decision::Transcode {
			target_tsuid: outbound_tsuid.to_owned(),
		};
	}
	if inbound_tsuid == outbound_tsuid && is_native(inbound_tsuid) {
		return Decision::PassThrough;
	}
	if inbound_tsuid != outbound_tsuid && !is_native(inbound_tsuid) {
		return Decision::Transcode {
			target_tsuid: outbound_tsuid.to_owned(),
		};
	}
	Decision::PassThrough
}

/// Substitutes a requested target transfer syntax the writer side cannot
/// honestly produce: RLE Lossless becomes Explicit VR Little Endian (never
/// written), and any other non-native (JPEG-family, JPEG 2000, JPEG-LS, lossy
/// video, …) target becomes JPEG Baseline, the only encapsulated bitstream
/// [`write_encapsulated_pixel_data`] actually encodes.
pub fn substitute_unwritable_target(requested: &str) -> &str {
	if requested == RLE_LOSSLESS {
		EXPLICIT_VR_LITTLE_ENDIAN
	} else if !is_native(requested) && requested != JPEG_BASELINE {
		JPEG_BASELINE
	} else {
		requested
	}
}

#[derive(Debug, Error)]
pub enum TranscodeError {
	#[error(transparent)]
	PixelData(#[from] dicom_pixeldata::Error),
	#[error("dataset has no PixelData element")]
	NoPixelData,
	#[error(transparent)]
	Frame(#[from] descriptor::FrameError),
}

/// Reads the static [`ImageDescriptor`] for `dataset`'s pixel data, used to
/// build a [`BytesWithImageDescriptor`] and to drive frame extraction.
pub fn image_descriptor(dataset: &InMemDicomObject) -> Result<ImageDescriptor, TranscodeError> {
	if dataset.element(tags::PIXEL_DATA).is_err() {
		return Err(TranscodeError::NoPixelData);
	}
	let decoded = dataset.decode_pixel_data()?;
	let photometric_interpretation = match decoded.photometric_interpretation() {
		"MONOCHROME1" => PhotometricInterpretation::Monochrome1,
		"MONOCHROME2" => PhotometricInterpretation::Monochrome2,
		"PALETTE COLOR" => PhotometricInterpretation::PaletteColor,
		"RGB" => PhotometricInterpretation::Rgb,
		"YBR_FULL" => PhotometricInterpretation::YbrFull,
		"YBR_FULL_422" => PhotometricInterpretation::YbrFull422,
		_ => PhotometricInterpretation::Other,
	};

	Ok(ImageDescriptor {
		rows: decoded.rows(),
		columns: decoded.columns(),
		samples_per_pixel: decoded.samples_per_pixel(),
		bits_allocated: decoded.bits_allocated(),
		bits_stored: decoded.bits_stored(),
		frames: decoded.number_of_frames(),
		photometric_interpretation,
	})
}

/// Drives the re-encode path: decodes the dataset's pixel
/// data, optionally masks every frame, and writes it back either as a native
/// (uncompressed) element or, for a JPEG-family `target_tsuid`, as an
/// encapsulated (fragmented) one via the `image` crate's encoder. The
/// caller is responsible for having already substituted RLE Lossless
/// targets with Explicit VR Little Endian
/// ([`substitute_unwritable_target`]) since this function has no writer
/// for it.
pub fn recode(
	dataset: &InMemDicomObject,
	mask: Option<&MaskArea>,
	input_tsuid: &str,
	target_tsuid: &str,
) -> Result<InMemDicomObject, TranscodeError> {
	let descriptor = image_descriptor(dataset)?;
	// Confirm the on-the-wire fragment stream actually demuxes into
	// `descriptor.frames` frames (native aligned slices, RLE's fragment-i-is-
	// frame-(i-1), or JPEG SOI/EOI-delimited fragments) before handing the
	// whole thing to the external decoder, so a malformed fragment stream
	// fails with the same errors a manual per-frame reader would raise.
	let source = build_frame_source(dataset, descriptor, input_tsuid)?;
	for frame in 0..descriptor.frames {
		frames::extract_frame(&source, frame)?;
	}
	let decoded = dataset.decode_pixel_data()?;
	let mut samples = decoded.data().to_vec();

	if let Some(mask) = mask {
		let frame_length = descriptor.frame_length();
		for frame in samples.chunks_mut(frame_length.max(1)) {
			apply_mask(frame, &descriptor, mask);
		}
	}

	let mut out = dataset.clone();
	if is_native(target_tsuid) {
		write_native_pixel_data(&mut out, &descriptor, samples)?;
	} else {
		write_encapsulated_pixel_data(&mut out, &descriptor, &samples, target_tsuid)?;
	}
	Ok(out)
}

/// Reads `PixelData` off `dataset` as it appears on the wire -- a single
/// fragment for native (uncompressed) syntaxes, one fragment per item
/// (Basic Offset Table excluded) for encapsulated ones -- and wraps it as a
/// [`BytesWithImageDescriptor`] for frame-boundary extraction.
fn build_frame_source(
	dataset: &InMemDicomObject,
	descriptor: ImageDescriptor,
	input_tsuid: &str,
) -> Result<InMemoryFrameSource, TranscodeError> {
	use dicom::core::value::Value;

	let element = dataset.element(tags::PIXEL_DATA).map_err(|_| TranscodeError::NoPixelData)?;
	let fragments: Vec<Bytes> = match element.value() {
		Value::PixelSequence(sequence) => sequence.fragments().iter().map(|fragment| Bytes::copy_from_slice(fragment)).collect(),
		Value::Primitive(primitive) => vec![Bytes::copy_from_slice(&primitive.to_bytes())],
		Value::Sequence(_) => return Err(TranscodeError::NoPixelData),
	};

	Ok(InMemoryFrameSource {
		descriptor,
		transfer_syntax: input_tsuid.to_owned(),
		fragments,
		palette_lut: None,
	})
}

fn write_native_pixel_data(
	dataset: &mut InMemDicomObject,
	descriptor: &ImageDescriptor,
	samples: Vec<u8>,
) -> Result<(), TranscodeError> {
	use dicom::core::{PrimitiveValue, VR};

	let vr = if descriptor.bits_allocated > 8 { VR::OW } else { VR::OB };
	dataset.put_element(dicom::core::DataElement::new(
		tags::PIXEL_DATA,
		vr,
		PrimitiveValue::U8(samples.into()),
	));
	Ok(())
}

/// Re-compresses each frame independently into a JPEG Baseline bitstream and
/// rewrites `PixelData` as an encapsulated pixel sequence: a Basic Offset
/// Table item followed by one fragment per frame. Callers must have already
/// run `target_tsuid` through [`substitute_unwritable_target`]; this is the
/// only encapsulated bitstream the encoder actually produces, so anything
/// else would mislabel the bytes it writes.
fn write_encapsulated_pixel_data(
	dataset: &mut InMemDicomObject,
	descriptor: &ImageDescriptor,
	samples: &[u8],
	target_tsuid: &str,
) -> Result<(), TranscodeError> {
	use dicom::core::value::{PixelFragmentSequence, Value};
	use dicom::core::{DataElement, VR};

	debug_assert_eq!(
		target_tsuid, JPEG_BASELINE,
		"write_encapsulated_pixel_data only ever produces JPEG Baseline bytes; \
		 callers must substitute_unwritable_target first"
	);

	let frame_length = descriptor.frame_length();
	let color = match descriptor.samples_per_pixel {
		1 => image::ColorType::L8,
		3 => image::ColorType::Rgb8,
		_ => return Err(TranscodeError::NoPixelData),
	};

	let mut fragments = Vec::with_capacity(descriptor.frames as usize);
	for frame in samples.chunks(frame_length.max(1)) {
		let mut buf = Vec::new();
		let mut encoder = image::codecs::jpeg::JpegEncoder::new(&mut buf);
		encoder
			.encode(frame, descriptor.columns.into(), descriptor.rows.into(), color)
			.map_err(|_| TranscodeError::NoPixelData)?;
		fragments.push(buf);
	}

	let sequence = PixelFragmentSequence::new(Vec::new(), fragments);
	dataset.put_element(DataElement::new(tags::PIXEL_DATA, VR::OB, Value::PixelSequence(sequence)));
	Ok(())
}

/// Applies `mask` to every sample row inside the rectangle, zeroing it out.
/// Operates directly on a decoded, native-order frame buffer.
pub fn apply_mask(frame: &mut [u8], descriptor: &ImageDescriptor, mask: &MaskArea) {
	let bytes_per_sample = (descriptor.bits_allocated as usize).div_ceil(8);
	let sample_stride = descriptor.samples_per_pixel as usize * bytes_per_sample;
	let row_stride = descriptor.columns as usize * sample_stride;

	let y_end = (mask.y + mask.height).min(descriptor.rows as u32);
	let x_end = (mask.x + mask.width).min(descriptor.columns as u32);

	for y in mask.y..y_end {
		let row_start = y as usize * row_stride;
		for x in mask.x..x_end {
			let pixel_start = row_start + x as usize * sample_stride;
			if let Some(slice) = frame.get_mut(pixel_start..pixel_start + sample_stride) {
				slice.fill(0);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const IVR_LE: &str = "1.2.840.10008.1.2";
	const EVR_LE: &str = "1.2.840.10008.1.2.1";
	const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
	const MPEG2: &str = "1.2.840.10008.1.2.4.100";

	#[test]
	fn no_pixel_data_passes_through() {
		assert_eq!(decide(false, true, IVR_LE, EVR_LE), Decision::PassThrough);
	}

	#[test]
	fn mask_forces_transcode_unless_lossy_video() {
		assert_eq!(
			decide(true, true, EVR_LE, EVR_LE),
			Decision::Transcode {
				target_tsuid: EVR_LE.to_owned()
			}
		);
		assert_eq!(decide(true, true, MPEG2, EVR_LE), Decision::PassThrough);
	}

	#[test]
	fn same_native_syntax_passes_through() {
		assert_eq!(decide(true, false, EVR_LE, EVR_LE), Decision::PassThrough);
	}

	#[test]
	fn differing_syntax_from_a_non_native_source_transcodes() {
		assert_eq!(
			decide(true, false, JPEG_BASELINE, EVR_LE),
			Decision::Transcode {
				target_tsuid: EVR_LE.to_owned()
			}
		);
	}

	#[test]
	fn differing_syntax_between_two_native_syntaxes_passes_through() {
		// Both ends native: the on-the-wire bytes differ only in VR
		// explicitness/endianness, which the DIMSE layer (not the
		// transcoder) already handles when writing with the target TS.
		assert_eq!(decide(true, false, IVR_LE, EVR_LE), Decision::PassThrough);
	}

	#[test]
	fn rle_output_is_never_requested() {
		assert_eq!(substitute_unwritable_target(RLE_LOSSLESS), EXPLICIT_VR_LITTLE_ENDIAN);
		assert_eq!(substitute_unwritable_target(EVR_LE), EVR_LE);
	}

	#[test]
	fn mask_zeroes_the_targeted_rectangle_only() {
		let descriptor = ImageDescriptor {
			rows: 4,
			columns: 4,
			samples_per_pixel: 1,
			bits_allocated: 8,
			bits_stored: 8,
			frames: 1,
			photometric_interpretation: PhotometricInterpretation::Monochrome2,
		};
		let mut frame = vec![0xFF_u8; 16];
		apply_mask(
			&mut frame,
			&descriptor,
			&MaskArea {
				x: 1,
				y: 1,
				width: 2,
				height: 2,
			},
		);
		let expected: Vec<u8> = vec![
			0xFF, 0xFF, 0xFF, 0xFF, //
			0xFF, 0x00, 0x00, 0xFF, //
			0xFF, 0x00, 0x00, 0xFF, //
			0xFF, 0xFF, 0xFF, 0xFF,
		];
		assert_eq!(frame, expected);
	}
}
