// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! dpbtrace, runs a textual trace of slice headers through the DPB and prints the pictures in
//! display order.
//!
//! Each line of the trace describes one picture, in decoding order:
//!
//! ```text
//! <I|P|B> <frame_num> <pic_order_cnt> [lt] [refs=N] [mmco=OP[:ARG...]]... [rplm=IDC:VALUE]...
//! ```
//!
//! `I` is an IDR picture, `P` a reference picture and `B` a non-reference picture. `lt` marks an
//! IDR picture as long-term. Empty lines and lines starting with `#` are ignored.

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use argh::FromArgs;

use cros_h264_dpb::codec::h264::header::Mmco;
use cros_h264_dpb::codec::h264::header::ModificationOfPicNums;
use cros_h264_dpb::codec::h264::header::RefPicListModification;
use cros_h264_dpb::codec::h264::header::RefPicMarking;
use cros_h264_dpb::codec::h264::params::BitstreamRestriction;
use cros_h264_dpb::codec::h264::params::Level;
use cros_h264_dpb::codec::h264::params::SequenceParams;
use cros_h264_dpb::decoder::PictureDecoder;
use cros_h264_dpb::decoder::PictureParams;
use cros_h264_dpb::decoder::StreamDecoder;
use cros_h264_dpb::frame_pool::HeapFrame;
use cros_h264_dpb::frame_pool::HeapFrameAllocator;

/// Runs a slice header trace through the H.264 DPB
#[derive(Debug, FromArgs)]
struct Args {
    /// trace file
    #[argh(positional)]
    input: PathBuf,

    /// max_num_ref_frames of the sequence
    #[argh(option, default = "4")]
    max_num_ref_frames: u32,

    /// max_dec_frame_buffering of the sequence
    #[argh(option, default = "4")]
    max_dec_frame_buffering: u32,

    /// log2_max_frame_num_minus4 of the sequence
    #[argh(option, default = "0")]
    log2_max_frame_num_minus4: u8,

    /// allow gaps in frame_num
    #[argh(switch)]
    gaps: bool,

    /// output pictures in decoding order
    #[argh(switch)]
    no_reordering: bool,

    /// print the reference picture list used by each picture
    #[argh(switch)]
    show_refs: bool,
}

/// Backend that only reports the reference picture list it is given.
struct TraceBackend {
    show_refs: bool,
}

impl PictureDecoder<HeapFrame> for TraceBackend {
    fn decode_picture(
        &mut self,
        picture: &PictureParams,
        target: &HeapFrame,
        ref_pic_list0: &[Option<&HeapFrame>],
    ) -> anyhow::Result<u32> {
        target.data_mut()[0] = picture.external_id as u8;

        if self.show_refs {
            let refs: Vec<_> = ref_pic_list0
                .iter()
                .map(|r| match r {
                    Some(frame) => format!("#{}", frame.data()[0]),
                    None => "-".into(),
                })
                .collect();
            println!(
                "  #{} frame_num {} refs [{}]",
                picture.external_id,
                picture.frame_num,
                refs.join(" ")
            );
        }

        Ok(0)
    }
}

fn parse_numbers(values: &str) -> anyhow::Result<Vec<u32>> {
    values
        .split(':')
        .map(|v| v.parse::<u32>().with_context(|| format!("invalid number {:?}", v)))
        .collect()
}

fn parse_mmco(value: &str) -> anyhow::Result<Option<Mmco>> {
    let numbers = parse_numbers(value)?;
    let (op, args) = numbers
        .split_first()
        .ok_or_else(|| anyhow!("empty mmco"))?;
    let arg = |i: usize| args.get(i).copied().unwrap_or(0);

    // The arguments follow the order of the syntax elements of each operation.
    let mmco = match op {
        1 => Mmco::from_syntax(1, arg(0), 0, 0, 0),
        2 => Mmco::from_syntax(2, 0, arg(0), 0, 0),
        3 => Mmco::from_syntax(3, arg(0), 0, arg(1), 0),
        4 => Mmco::from_syntax(4, 0, 0, 0, arg(0)),
        6 => Mmco::from_syntax(6, 0, 0, arg(0), 0),
        op => Mmco::from_syntax(*op, 0, 0, 0, 0),
    }?;

    Ok(mmco)
}

fn parse_line(line: &str, external_id: u32) -> anyhow::Result<PictureParams> {
    let mut tokens = line.split_whitespace();
    let mut next = |name: &str| tokens.next().ok_or_else(|| anyhow!("missing {}", name));

    let kind = next("picture type")?;
    let frame_num = next("frame_num")?.parse().context("invalid frame_num")?;
    let pic_order_cnt = next("pic_order_cnt")?
        .parse()
        .context("invalid pic_order_cnt")?;

    let (idr, nal_ref_idc) = match kind {
        "I" => (true, 3),
        "P" => (false, 2),
        "B" => (false, 0),
        _ => return Err(anyhow!("unknown picture type {:?}", kind)),
    };

    let mut picture = PictureParams {
        frame_num,
        pic_order_cnt,
        idr,
        nal_ref_idc,
        external_id,
        ..Default::default()
    };

    let mut mmcos = vec![];
    let mut modifications = vec![];
    for token in tokens {
        match token.split_once('=') {
            None if token == "lt" => picture.dec_ref_pic_marking.long_term_reference_flag = true,
            Some(("refs", n)) => {
                let n: u8 = n.parse().context("invalid refs")?;
                picture.num_ref_idx_l0_active_minus1 = n.saturating_sub(1);
            }
            Some(("mmco", value)) => mmcos.extend(parse_mmco(value)?),
            Some(("rplm", value)) => match parse_numbers(value)?.as_slice() {
                [idc, value] => modifications.push(ModificationOfPicNums::from_syntax(*idc, *value)?),
                _ => return Err(anyhow!("rplm needs IDC:VALUE, got {:?}", value)),
            },
            _ => return Err(anyhow!("unknown token {:?}", token)),
        }
    }

    if !mmcos.is_empty() {
        picture.dec_ref_pic_marking = RefPicMarking {
            long_term_reference_flag: picture.dec_ref_pic_marking.long_term_reference_flag,
            ..RefPicMarking::adaptive(mmcos)
        };
    }
    if !modifications.is_empty() {
        picture.ref_pic_list_modification = RefPicListModification::new(modifications);
    }

    Ok(picture)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let seq = SequenceParams {
        profile_idc: 100,
        level_idc: Level::L4,
        pic_width_in_mbs: 1,
        pic_height_in_mbs: 1,
        max_num_ref_frames: args.max_num_ref_frames,
        log2_max_frame_num_minus4: args.log2_max_frame_num_minus4,
        gaps_in_frame_num_value_allowed_flag: args.gaps,
        bitstream_restriction: Some(BitstreamRestriction {
            max_num_reorder_frames: args.max_dec_frame_buffering,
            max_dec_frame_buffering: args.max_dec_frame_buffering,
        }),
        ..Default::default()
    };

    let mut decoder = StreamDecoder::new(
        HeapFrameAllocator::new(),
        TraceBackend {
            show_refs: args.show_refs,
        },
        args.no_reordering,
    );
    decoder.activate_sequence(&seq)?;

    let input = File::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;

    let mut pictures = vec![];
    for (line_num, line) in BufReader::new(input).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let external_id = pictures.len() as u32;
        let picture = parse_line(line, external_id)
            .with_context(|| format!("line {}: {:?}", line_num + 1, line))?;

        if let Err(e) = decoder.decode(&picture) {
            log::error!("picture #{}: {}", external_id, e);
        }
        pictures.push(picture);

        print_outputs(&mut decoder, &pictures);
    }

    decoder.flush();
    print_outputs(&mut decoder, &pictures);

    Ok(())
}

fn print_outputs(
    decoder: &mut StreamDecoder<HeapFrameAllocator, TraceBackend>,
    pictures: &[PictureParams],
) {
    while let Some(record) = decoder.next_output() {
        match pictures.get(record.external_id as usize) {
            Some(picture) => println!(
                "#{} frame_num {} POC {}{}",
                record.external_id,
                picture.frame_num,
                picture.pic_order_cnt,
                if record.is_idr { " IDR" } else { "" }
            ),
            None => println!("#{}", record.external_id),
        }
    }
}
