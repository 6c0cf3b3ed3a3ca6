// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cmp::Ordering;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::picture::PictureData;

/// Total order of the DPB slots.
///
/// Short-term pictures (including non-existing ones) come first, most recent first. Long-term
/// pictures follow by ascending `LongTermPicNum`, then the non-reference pictures still waiting
/// for output, then free slots. With this order the initial reference picture list for P frames
/// (8.2.4.2.1) is the prefix of the table.
pub fn compare_pictures(a: &PictureData, b: &PictureData) -> Ordering {
    match (a.reference.is_ref(), b.reference.is_ref()) {
        (false, false) => b.needed_for_output.cmp(&a.needed_for_output),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => match (a.reference.is_short_term(), b.reference.is_short_term()) {
            (true, true) => b.pic_num.cmp(&a.pic_num),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => a.pic_num.cmp(&b.pic_num),
        },
    }
}

impl<T: Clone> Dpb<T> {
    /// Restores the order of the slots after they have been modified. The sort is stable.
    pub(super) fn sort_pictures(&mut self) {
        self.slots.sort_by(|a, b| compare_pictures(&a.data, &b.data));

        log::trace!("Dpb state after sorting: {:#?}", self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::picture::Reference;

    fn pic(reference: Reference, pic_num: i32, needed_for_output: bool) -> PictureData {
        PictureData {
            pic_num,
            reference,
            needed_for_output,
            ..Default::default()
        }
    }

    #[test]
    fn ordering() {
        let mut pics = vec![
            pic(Reference::None, 9, false),
            pic(Reference::LongTerm, 2, false),
            pic(Reference::None, 8, true),
            pic(Reference::ShortTerm, -3, true),
            pic(Reference::LongTerm, 0, true),
            pic(Reference::NonExisting, 4, false),
            pic(Reference::ShortTerm, 5, false),
        ];

        pics.sort_by(compare_pictures);

        let order: Vec<_> = pics.iter().map(|p| (p.reference, p.pic_num)).collect();
        assert_eq!(
            order,
            vec![
                (Reference::ShortTerm, 5),
                (Reference::NonExisting, 4),
                (Reference::ShortTerm, -3),
                (Reference::LongTerm, 0),
                (Reference::LongTerm, 2),
                (Reference::None, 8),
                (Reference::None, 9),
            ]
        );
    }

    #[test]
    fn non_reference_ties_keep_their_order() {
        let mut pics = vec![
            pic(Reference::None, 3, false),
            pic(Reference::None, 1, true),
            pic(Reference::None, 2, false),
            pic(Reference::None, 0, true),
        ];

        pics.sort_by(compare_pictures);

        let order: Vec<_> = pics.iter().map(|p| p.pic_num).collect();
        assert_eq!(order, vec![1, 0, 3, 2]);
    }

    #[test]
    fn order_is_antisymmetric() {
        let pics = [
            pic(Reference::None, 0, false),
            pic(Reference::None, 0, true),
            pic(Reference::ShortTerm, 1, false),
            pic(Reference::NonExisting, 2, false),
            pic(Reference::LongTerm, 0, false),
            pic(Reference::LongTerm, 1, false),
        ];

        for a in &pics {
            for b in &pics {
                assert_eq!(compare_pictures(a, b), compare_pictures(b, a).reverse());
            }
        }
    }
}
