//! External collaborator interfaces.
//!
//! The container framework stays transport- and codec-agnostic: payload
//! decompression, out-of-file payload fetching, and script decompilation are
//! all services the caller injects. Schema-blob fetching has its own trait
//! next to the loader ([`FetchSchema`][crate::schema::remote::FetchSchema]).

use std::cell::RefCell;
use std::future::Future;

use crate::error::{Error, Result};

thread_local! {
    static ZSTD_DCTX: RefCell<zstd_safe::DCtx<'static>> = RefCell::new(zstd_safe::DCtx::create());
}

/// Block decompressor for chunk payloads.
///
/// `expected_size` is the size the chunk header declared; implementations may
/// use it to size their output buffer but must not pad or truncate to it.
/// The framework itself verifies the decompressed length.
pub trait Decompress {
    fn decompress(&self, src: &[u8], expected_size: usize) -> Result<Vec<u8>>;
}

/// Zstandard-backed [`Decompress`] using a thread-local decompression
/// context, so repeated chunks skip the context setup cost.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZstdDecompressor;

impl Decompress for ZstdDecompressor {
    fn decompress(&self, src: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; expected_size];
        let used = ZSTD_DCTX
            .with_borrow_mut(|dctx| {
                dctx.reset(zstd_safe::ResetDirective::SessionAndParameters)?;
                dctx.decompress(&mut out[..], src)
            })
            .map_err(|code| Error::Service(format!("zstd failure, code {code}")))?;
        out.truncate(used);
        Ok(out)
    }
}

/// Fetch service for payloads stored outside the container file (streamed
/// resource archives). Returns exactly `size` bytes starting at `offset`
/// within the named resource.
pub trait FetchPayload {
    fn fetch(
        &self,
        path: &str,
        offset: u64,
        size: u64,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Decompiler service for script records. Consumed only by the script
/// property shape; the engine never interprets bytecode itself.
pub trait Decompile {
    fn decompile(&self, bytecode: &[u8]) -> Result<String>;
}
