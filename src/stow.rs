//! The HTTP STOW-RS client used by `WebForwardDestination`: POSTs a single
//! instance as a `multipart/related` request to `${endpoint}/studies`.

use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum StowError {
	#[error("failed to encode the DICOM file: {0}")]
	Encode(#[from] dicom::object::WriteError),
	#[error("failed to build the file meta table: {0}")]
	Meta(String),
	#[error("request failed: {0}")]
	Request(#[from] reqwest::Error),
	#[error("STOW-RS endpoint returned {0}")]
	Rejected(StatusCode),
	#[error("invalid multipart/related Content-Type: {0}")]
	InvalidContentType(String),
}

/// A reusable STOW-RS client for one endpoint.
pub struct StowClient {
	http: Client,
	endpoint_url: String,
}

impl StowClient {
	pub fn new(endpoint_url: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
		let http = Client::builder().timeout(request_timeout).build()?;
		Ok(Self {
			http,
			endpoint_url: endpoint_url.into(),
		})
	}

	/// POSTs one instance. `dataset` must already carry the final
	/// (post-editor, post-transcode) attributes and `output_tsuid` must
	/// never be RLE Lossless.
	#[instrument(skip(self, dataset), fields(iuid))]
	pub async fn store(
		&self,
		iuid: &str,
		cuid: &str,
		output_tsuid: &str,
		dataset: InMemDicomObject,
		content_type: &str,
	) -> Result<(), StowError> {
		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(cuid)
			.media_storage_sop_instance_uid(iuid)
			.transfer_syntax(output_tsuid)
			.build()
			.map_err(|err| StowError::Meta(err.to_string()))?;
		let file: FileDicomObject<InMemDicomObject> = dataset.with_exact_meta(meta);

		let mut bytes = Vec::new();
		file.write_all(&mut bytes)?;

		let part = reqwest::multipart::Part::bytes(bytes)
			.mime_str(content_type)
			.unwrap_or_else(|_| reqwest::multipart::Part::bytes(Vec::new()));
		let form = reqwest::multipart::Form::new().part("instance", part);

		// `RequestBuilder::multipart` defaults to a `multipart/form-data`
		// Content-Type; STOW-RS requires `multipart/related` naming the
		// part's media type, built by hand the same way the DICOMweb server
		// side builds it for WADO-RS responses. Replace (not append) the
		// header `.multipart` sets, since `RequestBuilder::header` appends.
		let content_type_header = format!(r#"multipart/related; type="{content_type}"; boundary={}"#, form.boundary());
		let header_value = reqwest::header::HeaderValue::from_str(&content_type_header)
			.map_err(|err| StowError::InvalidContentType(err.to_string()))?;

		let url = format!("{}/studies", self.endpoint_url.trim_end_matches('/'));
		let mut request = self.http.post(&url).multipart(form).build()?;
		request.headers_mut().insert(CONTENT_TYPE, header_value);
		let response = self.http.execute(request).await?;

		if response.status().is_success() {
			info!(status = %response.status(), "STOW-RS instance accepted");
			Ok(())
		} else {
			Err(StowError::Rejected(response.status()))
		}
	}
}
