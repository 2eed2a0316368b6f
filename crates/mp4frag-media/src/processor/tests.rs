use super::*;
use crate::boxes::BoxReader;
use crate::linear_reader::{LinearReader, DEFAULT_MAX_BUFFER};
use crate::movie::{Mp4File, Track};
use crate::testing::{Mp4Builder, TrackSpec};
use crate::ErrorKind;
use std::io::Cursor;

struct AppendByte;

impl TrackHandler for AppendByte {
    fn processed_sample_size(&mut self, sample: &Sample, _input: &mut dyn ReadSeek) -> Result<u32> {
        Ok(sample.size + 1)
    }

    fn process_sample(&mut self, _sample: &Sample, mut data: Vec<u8>) -> Result<Vec<u8>> {
        data.push(0xAA);
        Ok(data)
    }
}

/// Appends one byte to every sample of one track.
struct AppendTo(u32);

impl HandlerFactory for AppendTo {
    fn create_track_handler(&mut self, track: &Track) -> Result<Option<Box<dyn TrackHandler>>> {
        Ok((track.id == self.0).then(|| Box::new(AppendByte) as Box<dyn TrackHandler>))
    }
}

fn av() -> Mp4Builder {
    Mp4Builder::new()
        .track(TrackSpec::video(1, 12, 100).timescale(1000))
        .track(TrackSpec::audio(2, 30, 40).timescale(1000))
}

fn run(input: &[u8], factory: &mut dyn HandlerFactory) -> Result<(Vec<u8>, ProcessReport)> {
    let mut input = Cursor::new(input.to_vec());
    let mut output = Cursor::new(Vec::new());
    let report = Processor::new().process(&mut input, &mut output, factory, None)?;
    Ok((output.into_inner(), report))
}

fn top_level(data: &[u8]) -> Vec<(u64, Mp4Box)> {
    let mut stream = Cursor::new(data.to_vec());
    BoxReader::new(&mut stream)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap()
}

fn payloads(data: &[u8], track_id: u32) -> Vec<Vec<u8>> {
    let file = Mp4File::parse(&mut Cursor::new(data.to_vec())).unwrap();
    let movie = file.require_movie().unwrap();
    let mut reader = LinearReader::new(movie, Cursor::new(data.to_vec()), DEFAULT_MAX_BUFFER).unwrap();
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

fn appended(payloads: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    payloads
        .into_iter()
        .map(|mut p| {
            p.push(0xAA);
            p
        })
        .collect()
}

#[test]
fn test_identity_keeps_samples() {
    let input = av().samples_per_chunk(3).build();
    let (output, report) = run(&input, &mut IdentityFactory).unwrap();

    assert!(report.handled_tracks.is_empty());
    assert_eq!(report.samples, 42);
    assert_eq!(report.fragments, 0);
    assert_eq!(report.output_size, output.len() as u64);
    for track_id in [1, 2] {
        assert_eq!(payloads(&output, track_id), payloads(&input, track_id));
    }
}

#[test]
fn test_handler_changes_sample_sizes() {
    let input = av().samples_per_chunk(4).build();
    let (output, report) = run(&input, &mut AppendTo(1)).unwrap();

    assert_eq!(report.handled_tracks, vec![1]);
    assert_eq!(payloads(&output, 1), appended(payloads(&input, 1)));
    assert_eq!(payloads(&output, 2), payloads(&input, 2));

    let file = Mp4File::parse(&mut Cursor::new(output.clone())).unwrap();
    let movie = file.require_movie().unwrap();
    let before = Mp4File::parse(&mut Cursor::new(input.clone())).unwrap();
    let sizes = |m: &Movie| -> Vec<u32> {
        m.track(1).unwrap().sample_table.samples().iter().map(|s| s.size).collect()
    };
    let expected: Vec<u32> = sizes(before.require_movie().unwrap()).iter().map(|s| s + 1).collect();
    assert_eq!(sizes(movie), expected);
}

#[test]
fn test_fragmented_identity() {
    let input = av().fragmented(4).with_sidx().with_mfra().build();
    let (output, report) = run(&input, &mut IdentityFactory).unwrap();

    assert_eq!(report.fragments, 3);
    assert!(report.sidx_updated);
    assert!(report.mfra_updated);
    assert_eq!(output, input);
}

#[test]
fn test_fragmented_size_change_updates_indexes() {
    let input = av().fragmented(4).with_sidx().with_mfra().build();
    let (output, report) = run(&input, &mut AppendTo(1)).unwrap();
    assert_eq!(report.fragments, 3);
    assert_eq!(output.len(), input.len() + 12);

    assert_eq!(payloads(&output, 1), appended(payloads(&input, 1)));
    assert_eq!(payloads(&output, 2), payloads(&input, 2));

    let boxes = top_level(&output);
    let moof_offsets: Vec<u64> = boxes
        .iter()
        .filter(|(_, b)| b.box_type() == BoxType::MOOF)
        .map(|(o, _)| *o)
        .collect();
    let (sidx_offset, sidx) = boxes
        .iter()
        .find_map(|(o, b)| b.as_sidx().map(|s| (*o, s.clone())))
        .unwrap();
    let (mfra_offset, mfra) = boxes.iter().find(|(_, b)| b.box_type() == BoxType::MFRA).unwrap();

    let sidx_end = sidx_offset + Mp4Box::from(sidx.clone()).size();
    assert_eq!(sidx_end + sidx.first_offset, moof_offsets[0]);
    let mut ends = moof_offsets[1..].to_vec();
    ends.push(*mfra_offset);
    let sizes: Vec<u64> = sidx.references.iter().map(|r| r.referenced_size as u64).collect();
    let expected: Vec<u64> = moof_offsets.iter().zip(&ends).map(|(s, e)| e - s).collect();
    assert_eq!(sizes, expected);

    for tfra in mfra.children().iter().filter_map(Mp4Box::as_tfra) {
        for entry in &tfra.entries {
            assert!(moof_offsets.contains(&entry.moof_offset), "{}", entry.moof_offset);
        }
    }
}

#[test]
fn test_decoupled_fragments() {
    let builder = av().fragmented(5);
    let (init, media) = builder.build_segments();
    let mut output = Cursor::new(Vec::new());
    let report = Processor::new()
        .process_with_fragments(
            &mut Cursor::new(init.clone()),
            &mut Cursor::new(media.clone()),
            &mut output,
            &mut AppendTo(2),
            None,
        )
        .unwrap();
    let output = output.into_inner();

    assert_eq!(report.fragments, 3);
    assert_eq!(report.output_size, output.len() as u64);
    assert_eq!(top_level(&output)[0].1.box_type(), BoxType::MOOF);

    let whole = [init.clone(), media].concat();
    let processed = [init, output].concat();
    assert_eq!(payloads(&processed, 1), payloads(&whole, 1));
    assert_eq!(payloads(&processed, 2), appended(payloads(&whole, 2)));
}

#[test]
fn test_progress_and_cancellation() {
    let input = av().build();
    let mut steps = Vec::new();
    let mut record = |step: usize, total: usize| {
        steps.push((step, total));
        ControlFlow::Continue(())
    };
    Processor::new()
        .process(
            &mut Cursor::new(input.clone()),
            &mut Cursor::new(Vec::new()),
            &mut IdentityFactory,
            Some(&mut record),
        )
        .unwrap();
    assert_eq!(steps.len(), 42);
    assert_eq!(steps.last(), Some(&(42, 42)));

    let mut cancel = |step: usize, _total: usize| {
        if step == 3 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };
    let err = Processor::new()
        .process(
            &mut Cursor::new(input),
            &mut Cursor::new(Vec::new()),
            &mut IdentityFactory,
            Some(&mut cancel),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[test]
fn test_multiple_sidx_are_dropped() {
    let input = av().fragmented(4).with_sidx().build();
    let boxes = top_level(&input);
    let (offset, sidx) = boxes.iter().find(|(_, b)| b.box_type() == BoxType::SIDX).unwrap();
    let end = (offset + sidx.size()) as usize;
    let doubled = [&input[..end], &input[*offset as usize..]].concat();

    let (output, report) = run(&doubled, &mut IdentityFactory).unwrap();
    assert!(!report.sidx_updated);
    assert!(top_level(&output).iter().all(|(_, b)| b.box_type() != BoxType::SIDX));
    assert_eq!(payloads(&output, 1), payloads(&input, 1));
}

#[test]
fn test_traf_without_tfhd() {
    let input = av().fragmented(4).build();
    let mut broken = Vec::new();
    for (offset, mut b) in top_level(&input) {
        match b.box_type() {
            BoxType::MDAT => broken.extend_from_slice(&input[offset as usize..(offset + b.size()) as usize]),
            BoxType::MOOF => {
                if let Some(traf) = b.child_mut(BoxType::TRAF) {
                    traf.remove_children(BoxType::TFHD);
                }
                broken.extend(b.to_bytes().unwrap());
            }
            _ => broken.extend(b.to_bytes().unwrap()),
        }
    }
    let err = run(&broken, &mut IdentityFactory).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFormat);
}

#[test]
fn test_missing_moov() {
    let mut data = 16u32.to_be_bytes().to_vec();
    data.extend_from_slice(b"free");
    data.extend([0u8; 8]);
    let err = run(&data, &mut IdentityFactory).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFormat);
}

/// How [`relayout`] rewrites each fragment of a file.
#[derive(Default, Clone, Copy)]
struct Relayout {
    /// Absolute `base_data_offset` in every `tfhd` instead of moof-relative.
    explicit_base: bool,
    /// 16-byte `mdat` headers.
    large_mdat: bool,
    /// `trun`s without a data offset; samples start at the `mdat` payload.
    no_data_offset: bool,
}

/// Re-serialize a fragmented file with another fragment layout. Sample
/// bytes are copied from the source `mdat` following each `moof`.
fn relayout(data: &[u8], layout: Relayout) -> Vec<u8> {
    let boxes = top_level(data);
    let mut out = Vec::new();
    for (i, (offset, b)) in boxes.iter().enumerate() {
        match b.box_type() {
            BoxType::MDAT => {}
            BoxType::MOOF => {
                let Some((_, Mp4Box::Mdat(mdat))) = boxes.get(i + 1) else {
                    panic!("moof at {offset} is not followed by an mdat");
                };
                let mut moof = b.clone();
                // payload-relative start of every run, in source order
                let mut starts = Vec::new();
                for traf in moof.as_container_mut().unwrap().children.iter_mut() {
                    if let Some(tfhd) = traf.child_mut(BoxType::TFHD).and_then(Mp4Box::as_tfhd_mut) {
                        if layout.explicit_base {
                            tfhd.default_base_is_moof = false;
                            tfhd.base_data_offset = Some(0);
                        }
                    }
                    if let Some(container) = traf.as_container_mut() {
                        for trun in container.children.iter_mut().filter_map(Mp4Box::as_trun_mut) {
                            starts.push((offset + trun.data_offset as u64) - mdat.payload_offset);
                            if layout.no_data_offset {
                                trun.flags &= !TrunBox::FLAG_DATA_OFFSET;
                            }
                        }
                    }
                }

                let header_size = if layout.large_mdat { 16 } else { 8 };
                let moof_position = out.len() as u64;
                let payload_start = moof_position + moof.size() + header_size;
                let mut starts = starts.into_iter();
                for traf in moof.as_container_mut().unwrap().children.iter_mut() {
                    if let Some(tfhd) = traf.child_mut(BoxType::TFHD).and_then(Mp4Box::as_tfhd_mut) {
                        if layout.explicit_base {
                            tfhd.base_data_offset = Some(payload_start);
                        }
                    }
                    let base = if layout.explicit_base { payload_start } else { moof_position };
                    if let Some(container) = traf.as_container_mut() {
                        for trun in container.children.iter_mut().filter_map(Mp4Box::as_trun_mut) {
                            let start = starts.next().unwrap();
                            trun.data_offset = (payload_start + start - base) as i32;
                        }
                    }
                }

                out.extend(moof.to_bytes().unwrap());
                if layout.large_mdat {
                    out.extend(1u32.to_be_bytes());
                    out.extend_from_slice(b"mdat");
                    out.extend((mdat.payload_size + 16).to_be_bytes());
                } else {
                    out.extend((mdat.payload_size as u32 + 8).to_be_bytes());
                    out.extend_from_slice(b"mdat");
                }
                let payload = mdat.payload_offset as usize..(mdat.payload_offset + mdat.payload_size) as usize;
                out.extend_from_slice(&data[payload]);
            }
            _ => out.extend(b.to_bytes().unwrap()),
        }
    }
    out
}

#[test]
fn test_explicit_base_offsets_follow_the_new_layout() {
    let plain = av().fragmented(4).build();
    let input = relayout(
        &plain,
        Relayout {
            explicit_base: true,
            ..Default::default()
        },
    );
    for track_id in [1, 2] {
        assert_eq!(payloads(&input, track_id), payloads(&plain, track_id));
    }

    // only track 1 is transformed; track 2 must still resolve to its bytes
    let (output, report) = run(&input, &mut AppendTo(1)).unwrap();
    assert_eq!(report.fragments, 3);
    assert_eq!(payloads(&output, 1), appended(payloads(&plain, 1)));
    assert_eq!(payloads(&output, 2), payloads(&plain, 2));

    for (offset, b) in top_level(&output) {
        if b.box_type() != BoxType::MOOF {
            continue;
        }
        let payload_start = offset + b.size() + BOX_HEADER_SIZE;
        for traf in b.children_of(BoxType::TRAF) {
            let tfhd = traf.child(BoxType::TFHD).and_then(Mp4Box::as_tfhd).unwrap();
            assert_eq!(tfhd.base_data_offset, Some(payload_start));
        }
    }
}

#[test]
fn test_large_mdat_header_in_fragments() {
    let plain = Mp4Builder::new()
        .track(TrackSpec::video(1, 12, 100).timescale(1000))
        .fragmented(4)
        .build();
    let input = relayout(
        &plain,
        Relayout {
            large_mdat: true,
            no_data_offset: true,
            ..Default::default()
        },
    );
    assert_eq!(payloads(&input, 1), payloads(&plain, 1));

    let (output, _) = run(&input, &mut IdentityFactory).unwrap();
    assert_eq!(payloads(&output, 1), payloads(&plain, 1));
    // compact mdat headers on output
    assert_eq!(output.len(), input.len() - 3 * 8);
}

#[test]
fn test_sidx_must_keep_its_reserved_size() {
    let reserved = Mp4Box::from(SidxBox::default()).size();
    let pending = PendingSidx {
        position: 0,
        end: reserved,
        sidx: SidxBox {
            // needs a version 1 box, 8 bytes larger
            first_offset: u32::MAX as u64 + 1,
            ..Default::default()
        },
    };
    let mut output = Cursor::new(vec![0u8; reserved as usize + 16]);
    let err = finish_sidx(&mut output, Some(pending)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(output.into_inner(), vec![0u8; reserved as usize + 16]);
}
