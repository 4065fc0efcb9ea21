#![cfg(feature = "s3-integration-test")]

//! End-to-end tests against a real S3 bucket, gated by the
//! `s3-integration-test` feature.
//!
//! Run with e.g.
//!
//!     cargo t --features=s3-integration-test --test s3_integration
//!
//! Needs AWS credentials available in the environment: it creates a real
//! temporary bucket, exercises the filesystem facade against it, then
//! deletes everything it created.

use bytes::Bytes;
use rand::Rng;
use rstest::{fixture, rstest};
use tokio::runtime::Runtime;

use s3fs::{ClientOptions, Filesystem, Path};

struct TempBucket {
    runtime: Runtime,
    bucket_name: String,
    client: aws_sdk_s3::Client,
}

impl TempBucket {
    fn filesystem(&self) -> Filesystem {
        let mut options = ClientOptions::new();
        options.region = self.client.config().region().map(|r| r.as_ref().to_owned());
        options.allow_bucket_creation = true;
        options.allow_bucket_deletion = true;
        self.runtime.block_on(s3fs::open(options)).expect("open filesystem")
    }
}

#[fixture]
#[once]
fn temp_bucket() -> TempBucket {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("create runtime");
    let config = runtime.block_on(aws_config::from_env().load());
    let client = aws_sdk_s3::Client::new(&config);
    let bucket_name = format!("s3fs-integration-{:x}", rand::thread_rng().gen::<u64>());

    runtime
        .block_on(client.create_bucket().bucket(&bucket_name).send())
        .expect("create bucket");

    TempBucket {
        runtime,
        bucket_name,
        client,
    }
}

impl Drop for TempBucket {
    fn drop(&mut self) {
        let bucket_name = self.bucket_name.clone();
        let client = self.client.clone();
        self.runtime.block_on(async {
            let mut paginator = client.list_objects_v2().bucket(&bucket_name).into_paginator().send();
            while let Some(page) = paginator.next().await {
                for object in page.expect("list objects page").contents() {
                    let key = object.key().expect("object has a key").to_owned();
                    client.delete_object().bucket(&bucket_name).key(key).send().await.expect("delete object");
                }
            }
            client.delete_bucket().bucket(&bucket_name).send().await.expect("delete bucket");
        });
    }
}

#[rstest]
fn write_read_stat_and_delete_round_trip(temp_bucket: &TempBucket) {
    let fs = temp_bucket.filesystem();
    temp_bucket.runtime.block_on(async {
        let path = Path::new(temp_bucket.bucket_name.clone(), "greeting.txt");

        let mut out = fs.open_output_stream(path.clone(), Default::default()).await.expect("open output stream");
        out.write(Bytes::from_static(b"hello, s3fs")).await.expect("write");
        out.close().await.expect("close");

        let info = fs.stat(&path).await.expect("stat");
        assert!(info.is_file());
        assert_eq!(info.size, 11);

        let mut input = fs.open_input_file(path.clone(), Some(&info)).await.expect("open input file");
        let body = input.read(64).await.expect("read");
        assert_eq!(&body[..], b"hello, s3fs");

        fs.delete_file(&path).await.expect("delete file");
        let after = fs.stat(&path).await.expect("stat after delete");
        assert_eq!(after.file_type, s3fs::FileType::NotFound);
    });
}

#[rstest]
fn recursive_mkdir_then_delete_removes_markers(temp_bucket: &TempBucket) {
    let fs = temp_bucket.filesystem();
    temp_bucket.runtime.block_on(async {
        let dir = Path::new(temp_bucket.bucket_name.clone(), "a/b/c");
        fs.create_dir(&dir, true).await.expect("recursive mkdir");

        let info = fs.stat(&dir).await.expect("stat dir");
        assert!(info.is_directory());

        fs.delete_dir(&dir).await.expect("delete dir");
        let after = fs.stat(&dir).await.expect("stat after delete");
        assert_eq!(after.file_type, s3fs::FileType::NotFound);
    });
}

/// Spec scenario 3: `stat("bucket/dir/")` when `bucket/dir/obj` exists but
/// no `dir/` marker object does. A plain key listing under the prefix
/// should still classify it as a directory.
#[rstest]
fn stat_recognizes_implicit_directory_with_no_marker(temp_bucket: &TempBucket) {
    let fs = temp_bucket.filesystem();
    temp_bucket.runtime.block_on(async {
        let child = Path::new(temp_bucket.bucket_name.clone(), "implicit-dir/obj");
        let mut out = fs.open_output_stream(child.clone(), Default::default()).await.expect("open output stream");
        out.write(Bytes::from_static(b"x")).await.expect("write");
        out.close().await.expect("close");

        let dir = Path::new(temp_bucket.bucket_name.clone(), "implicit-dir");
        let info = fs.stat(&dir).await.expect("stat implicit directory");
        assert!(info.is_directory());

        fs.delete_file(&child).await.expect("cleanup");
    });
}

#[rstest]
fn listing_finds_nested_files(temp_bucket: &TempBucket) {
    let fs = temp_bucket.filesystem();
    temp_bucket.runtime.block_on(async {
        let base = Path::new(temp_bucket.bucket_name.clone(), "listing-test");
        for leaf in ["one.txt", "nested/two.txt"] {
            let path = base.join(leaf);
            let mut out = fs.open_output_stream(path, Default::default()).await.expect("open output stream");
            out.write(Bytes::from_static(b"x")).await.expect("write");
            out.close().await.expect("close");
        }

        let mut receiver = fs.list(s3fs::Selector {
            base_dir: base.clone(),
            recursive: true,
            max_recursion: usize::MAX,
            allow_not_found: false,
        });
        let mut seen = Vec::new();
        while let Some(batch) = receiver.recv().await {
            seen.extend(batch.expect("listing batch"));
        }
        assert!(seen.iter().any(|info| info.path.key().ends_with("one.txt")));
        assert!(seen.iter().any(|info| info.path.key().ends_with("nested/two.txt")));

        fs.delete_dir_contents(&base, true).await.expect("cleanup");
    });
}
