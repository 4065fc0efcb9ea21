//! Read and write streams onto individual S3 objects.

pub mod input_file;
pub mod output_stream;

pub use input_file::InputFile;
pub use output_stream::{MultipartBackend, OutputStream, OutputStreamOptions, S3MultipartBackend, MAX_PARTS, MULTIPART_THRESHOLD, PART_SIZE};
