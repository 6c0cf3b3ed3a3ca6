// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 decoded picture buffer.
//!
//! This crate keeps track of the pictures an H.264 decoder needs for inter prediction and
//! releases them in display order. It does not parse the bitstream nor reconstruct pixels: slice
//! headers are provided as the typed structures of [`codec::h264::header`], and the actual
//! decoding is delegated to a [`decoder::PictureDecoder`].
//!
//! [`codec::h264::dpb::Dpb`] implements the buffer itself, while [`decoder::StreamDecoder`]
//! drives it for a whole stream.

pub mod codec;
pub mod decoder;
pub mod frame_pool;
