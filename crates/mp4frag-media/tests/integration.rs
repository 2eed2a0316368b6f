//! Integration tests for mp4frag-media
//!
//! Files are synthetic movies written to a temporary directory, then
//! fragmented, processed and read back through the public API.

use mp4frag_media::crypto::{CipherFactory, CipherMode, CipherParams, Direction};
use mp4frag_media::fragmenter::{FragmentOptions, Fragmenter, TrackSelector};
use mp4frag_media::linear_reader::{LinearReader, DEFAULT_MAX_BUFFER};
use mp4frag_media::processor::{IdentityFactory, Processor};
use mp4frag_media::testing::{Mp4Builder, TrackSpec};
use mp4frag_media::{Error, ErrorKind, Mp4File};
use std::fs;
use std::io::Cursor;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

fn av() -> Mp4Builder {
    Mp4Builder::new()
        .track(TrackSpec::video(1, 20, 100).timescale(1000).sync_every(5))
        .track(TrackSpec::audio(2, 50, 40).timescale(1000))
        .samples_per_chunk(5)
}

fn write(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    path
}

fn reader(data: &[u8]) -> LinearReader<Cursor<Vec<u8>>> {
    let file = Mp4File::parse(&mut Cursor::new(data.to_vec())).unwrap();
    LinearReader::new(file.require_movie().unwrap(), Cursor::new(data.to_vec()), DEFAULT_MAX_BUFFER).unwrap()
}

fn payloads(data: &[u8], track_id: u32) -> Vec<Vec<u8>> {
    let mut reader = reader(data);
    reader.enable_track(track_id).unwrap();
    let mut out = Vec::new();
    loop {
        match reader.read_next_sample() {
            Ok((_, _, bytes)) => out.push(bytes),
            Err(Error::EndOfStream) => break,
            Err(e) => panic!("{e}"),
        }
    }
    out
}

fn file_payloads(path: &Path, track_id: u32) -> Vec<Vec<u8>> {
    payloads(&fs::read(path).unwrap(), track_id)
}

// ============================================================================
// Fragmenting
// ============================================================================

#[test]
fn test_fragment_file_preserves_samples() {
    let temp = tempdir().unwrap();
    let input = write(&temp, "in.mp4", &av().build());
    let output = temp.path().join("out.mp4");

    let options = FragmentOptions {
        fragment_duration_ms: Some(500),
        create_segment_index: true,
        ..Default::default()
    };
    let report = Fragmenter::new(options).fragment_file(&input, &output).unwrap();

    assert_eq!(report.anchor_track_id, 1);
    assert_eq!(report.fragment_duration_ms, 500);
    assert_eq!(report.output_size, fs::metadata(&output).unwrap().len());
    assert!(report.fragments_of(1).count() > 1);
    assert_eq!(report.fragments_of(1).map(|f| f.sample_count).sum::<usize>(), 20);
    assert_eq!(report.fragments_of(2).map(|f| f.sample_count).sum::<usize>(), 50);

    let file = Mp4File::open(&output).unwrap();
    assert!(file.is_fragmented());
    for track_id in [1, 2] {
        assert_eq!(file_payloads(&output, track_id), file_payloads(&input, track_id));
    }
}

#[test]
fn test_fragment_file_single_track() {
    let temp = tempdir().unwrap();
    let input = write(&temp, "in.mp4", &av().build());
    let output = temp.path().join("audio.mp4");

    let options = FragmentOptions {
        fragment_duration_ms: Some(400),
        track: TrackSelector::Audio,
        ..Default::default()
    };
    let report = Fragmenter::new(options).fragment_file(&input, &output).unwrap();

    assert_eq!(report.anchor_track_id, 2);
    assert!(report.fragments.iter().all(|f| f.track_id == 2));
    let file = Mp4File::open(&output).unwrap();
    assert_eq!(file.require_movie().unwrap().tracks().len(), 1);
    assert_eq!(file_payloads(&output, 2), file_payloads(&input, 2));
}

#[test]
fn test_refragment_fragmented_input() {
    let temp = tempdir().unwrap();
    let input = write(&temp, "in.mp4", &av().fragmented(2).build());
    let output = temp.path().join("out.mp4");

    let options = FragmentOptions {
        fragment_duration_ms: Some(500),
        ..Default::default()
    };
    Fragmenter::new(options).fragment_file(&input, &output).unwrap();

    for track_id in [1, 2] {
        assert_eq!(file_payloads(&output, track_id), payloads(&av().build(), track_id));
    }
}

#[test]
fn test_fragment_missing_file() {
    let temp = tempdir().unwrap();
    let err = Fragmenter::default()
        .fragment_file(temp.path().join("missing.mp4"), temp.path().join("out.mp4"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CannotOpenFile);
}

// ============================================================================
// Processing
// ============================================================================

#[test]
fn test_process_file_reports_progress() {
    let temp = tempdir().unwrap();
    let input = write(&temp, "in.mp4", &av().build());
    let output = temp.path().join("out.mp4");

    let mut steps = Vec::new();
    let mut listener = |step: usize, total: usize| {
        steps.push((step, total));
        ControlFlow::Continue(())
    };
    let report = Processor::new()
        .process_file(&input, &output, &mut IdentityFactory, Some(&mut listener))
        .unwrap();

    assert_eq!(report.samples, 70);
    assert_eq!(steps.len(), 70);
    assert_eq!(steps.last(), Some(&(70, 70)));
    assert_eq!(report.output_size, fs::metadata(&output).unwrap().len());
    for track_id in [1, 2] {
        assert_eq!(file_payloads(&output, track_id), file_payloads(&input, track_id));
    }
}

#[test]
fn test_fragment_then_encrypt_and_decrypt() {
    let temp = tempdir().unwrap();
    let input = write(&temp, "in.mp4", &av().build());
    let fragmented = temp.path().join("frag.mp4");
    let sealed = temp.path().join("sealed.mp4");
    let opened = temp.path().join("opened.mp4");

    let options = FragmentOptions {
        fragment_duration_ms: Some(500),
        create_segment_index: true,
        ..Default::default()
    };
    Fragmenter::new(options).fragment_file(&input, &fragmented).unwrap();

    let params = |direction| CipherParams::new(CipherMode::Cbcs, direction, [7; 16], [1; 16]);
    let mut encrypt = CipherFactory::new(params(Direction::Encrypt)).with_tracks([1]);
    let report = Processor::new()
        .process_file(&fragmented, &sealed, &mut encrypt, None)
        .unwrap();
    assert_eq!(report.handled_tracks, vec![1]);
    assert!(report.sidx_updated);
    assert!(report.fragments > 0);
    assert_eq!(fs::metadata(&sealed).unwrap().len(), fs::metadata(&fragmented).unwrap().len());
    assert_ne!(file_payloads(&sealed, 1), file_payloads(&input, 1));
    assert_eq!(file_payloads(&sealed, 2), file_payloads(&input, 2));

    let mut decrypt = CipherFactory::new(params(Direction::Decrypt)).with_tracks([1]);
    Processor::new()
        .process_file(&sealed, &opened, &mut decrypt, None)
        .unwrap();
    assert_eq!(fs::read(&opened).unwrap(), fs::read(&fragmented).unwrap());
}

#[test]
fn test_process_cancelled() {
    let temp = tempdir().unwrap();
    let input = write(&temp, "in.mp4", &av().build());
    let mut listener = |step: usize, _total: usize| {
        if step == 10 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };
    let err = Processor::new()
        .process_file(&input, temp.path().join("out.mp4"), &mut IdentityFactory, Some(&mut listener))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

// ============================================================================
// Linear reading
// ============================================================================

#[test]
fn test_linear_reader_follows_storage_order() {
    let data = av().build();
    let mut reader = reader(&data);
    reader.enable_track(1).unwrap();
    reader.enable_track(2).unwrap();

    let mut offsets = Vec::new();
    let mut counts = [0usize; 2];
    while let Ok((track_id, sample, bytes)) = reader.read_next_sample() {
        assert_eq!(bytes.len(), sample.size as usize);
        offsets.push(sample.offset);
        counts[track_id as usize - 1] += 1;
    }
    assert_eq!(counts, [20, 50]);
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(reader.buffer_fullness(), 0);
}

#[test]
fn test_linear_reader_buffers_other_tracks() {
    let data = av().build();
    let (first_track, _) = {
        let mut probe = reader(&data);
        probe.enable_track(1).unwrap();
        probe.enable_track(2).unwrap();
        probe.next_sample().unwrap()
    };
    let other = if first_track == 1 { 2 } else { 1 };

    let mut reader = reader(&data);
    reader.enable_track(1).unwrap();
    reader.enable_track(2).unwrap();
    let (sample, _) = reader.read_next_sample_for(other).unwrap();
    assert_eq!(sample.dts, 0);
    assert!(reader.buffer_fullness() > 0);

    // the buffered samples come out first, in order
    let (track_id, sample, _) = reader.read_next_sample().unwrap();
    assert_eq!(track_id, first_track);
    assert_eq!(sample.dts, 0);
}

#[test]
fn test_linear_reader_buffer_limit() {
    let data = av().build();
    let file = Mp4File::parse(&mut Cursor::new(data.clone())).unwrap();
    let mut probe = LinearReader::new(file.require_movie().unwrap(), Cursor::new(data.clone()), 1).unwrap();
    probe.enable_track(1).unwrap();
    probe.enable_track(2).unwrap();
    let (first_track, _) = probe.next_sample().unwrap();
    let other = if first_track == 1 { 2 } else { 1 };

    let mut reader = LinearReader::new(file.require_movie().unwrap(), Cursor::new(data), 1).unwrap();
    reader.enable_track(1).unwrap();
    reader.enable_track(2).unwrap();
    let err = reader.read_next_sample_for(other).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotEnoughSpace);
}

#[test]
fn test_linear_reader_unknown_track() {
    let data = av().build();
    let mut reader = reader(&data);
    assert_eq!(reader.enable_track(9).unwrap_err().kind(), ErrorKind::NoSuchItem);
    assert_eq!(reader.read_next_sample_for(1).unwrap_err().kind(), ErrorKind::NoSuchItem);
}

#[test]
fn test_linear_reader_fragmented_matches_flat() {
    let flat = av().build();
    let fragmented = av().fragmented(4).with_sidx().with_mfra().build();
    for track_id in [1, 2] {
        assert_eq!(payloads(&fragmented, track_id), payloads(&flat, track_id));
    }
}
