//! mp4frag-media: ISO BMFF box tree, sample tables, fragmentation and
//! fragment rewriting
//!
//! This crate holds everything `mp4frag` does to media files. The binary
//! only parses arguments and configuration.
//!
//! # Modules
//!
//! - `boxes` - Box tree model, parsing, serialization and inspection
//! - `movie` - Parsed file view: top-level layout, `moov`, tracks
//! - `sample_table` - Sample tables over `stbl`, `traf` and in-memory samples
//! - `linear_reader` - Storage-order reader across several tracks
//! - `fragmenter` - Unfragmented (or fragmented) MP4 to fragmented MP4
//! - `processor` - Per-sample rewriting of MP4 files with index upkeep
//! - `crypto` - AES-128 CTR/CBC/pattern stream ciphers and a cipher handler
//!
//! # Architecture
//!
//! Fragmenting a file happens in three steps:
//!
//! 1. Parsing the top-level boxes and the `moov` (sample data is never loaded)
//! 2. Planning every fragment from per-track cursors over the sample tables
//! 3. Writing `ftyp`, the new `moov`, then each `moof` and its `mdat`, copying
//!    sample bytes straight from the source
//!
//! Processing streams samples through [`processor::TrackHandler`]s and
//! patches sizes, offsets and the `sidx`/`mfra` indexes once the new layout
//! is known.

pub mod boxes;
pub mod crypto;
pub mod error;
pub mod fragmenter;
pub mod linear_reader;
pub mod movie;
pub mod processor;
pub mod sample_table;
pub mod stream;
pub mod time;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use boxes::{BoxReader, BoxType, Mp4Box};
pub use error::{Error, ErrorKind, Result};
pub use fragmenter::{FragmentOptions, FragmentReport, Fragmenter};
pub use linear_reader::LinearReader;
pub use movie::{Movie, Mp4File, Track, TrackType};
pub use processor::{HandlerFactory, ProcessReport, Processor, TrackHandler};
pub use sample_table::{Sample, SampleTable};
