use std::{
    mem::size_of,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use memmap2::MmapMut;

use crate::bitmap::SpaceBitmap;
use crate::utils::{align_up, is_aligned};

#[inline(always)]
fn byte_cas(old_value: u8, new_value: u8, address: *mut u8) -> bool {
    unsafe {
        let address = address.cast::<AtomicU8>();
        (*address)
            .compare_exchange_weak(old_value, new_value, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// Ages a card one step: dirty becomes aged, anything else becomes clean.
pub fn age_card_visitor(card: u8) -> u8 {
    if card == CardTable::CARD_DIRTY {
        card - 1
    } else {
        0
    }
}

/// Byte map with one byte per [CARD_SIZE](CardTable::CARD_SIZE) bytes of heap.
/// The write barrier dirties the card covering the written-to object; the
/// collectors age and scan cards to find old-to-young references.
pub struct CardTable {
    /// Mmapped pages for the card table
    mem_map: MmapMut,
    /// Value used to compute card table addresses from object addresses, see
    /// [get_biased_begin](CardTable::get_biased_begin)
    biased_begin: *const u8,
    /// Card table doesn't begin at the beginning of the mem_map, instead it is
    /// displaced by offset to allow the byte value of `biased_begin` to equal
    /// [CARD_DIRTY](CardTable::CARD_DIRTY).
    offset: usize,
}

impl CardTable {
    pub const CARD_SHIFT: usize = 10;
    pub const CARD_SIZE: usize = 1 << Self::CARD_SHIFT;
    pub const CARD_CLEAN: u8 = 0x0;
    pub const CARD_DIRTY: u8 = 0x70;
    pub const CARD_AGED: u8 = Self::CARD_DIRTY - 1;

    /// Create a card table covering `[heap_begin, heap_begin + heap_capacity)`.
    pub fn create(heap_begin: *const u8, heap_capacity: usize) -> Self {
        let capacity = heap_capacity / Self::CARD_SIZE;
        // 256 spare bytes so biased_begin can be displaced to make its low
        // byte equal CARD_DIRTY.
        let mem_map = MmapMut::map_anon(capacity + 256).unwrap();
        let cardtable_begin = mem_map.as_ptr();

        let mut biased_begin =
            (cardtable_begin as usize - ((heap_begin as usize) >> Self::CARD_SHIFT)) as *const u8;
        let mut offset = 0;
        let biased_byte = (biased_begin as usize & 0xff) as u8;
        if biased_byte != Self::CARD_DIRTY {
            let delta = Self::CARD_DIRTY as isize - biased_byte as isize;
            offset = (delta + if delta < 0 { 0x100 } else { 0 }) as usize;
            biased_begin = (biased_begin as usize + offset) as *const u8;
        }
        debug_assert_eq!((biased_begin as usize & 0xff) as u8, Self::CARD_DIRTY);

        Self {
            mem_map,
            biased_begin,
            offset,
        }
    }

    /// Returns a value that when added to a heap address >>
    /// [CARD_SHIFT](CardTable::CARD_SHIFT) addresses the appropriate card
    /// table byte. Its low byte equals [CARD_DIRTY](CardTable::CARD_DIRTY),
    /// which lets a runtime's barrier store that byte without loading it.
    pub fn get_biased_begin(&self) -> *mut u8 {
        self.biased_begin as _
    }

    pub fn mem_map_begin(&self) -> *mut u8 {
        self.mem_map.as_ptr() as _
    }

    pub fn mem_map_size(&self) -> usize {
        self.mem_map.len()
    }

    #[inline]
    pub fn card_from_addr(&self, addr: *const u8) -> *mut u8 {
        let card_addr = self.biased_begin as usize + (addr as usize >> Self::CARD_SHIFT);
        debug_assert!(self.is_valid_card(card_addr as _));
        card_addr as _
    }

    #[inline]
    pub fn addr_from_card(&self, card_addr: *const u8) -> *mut u8 {
        debug_assert!(self.is_valid_card(card_addr));
        let offset = card_addr as usize - self.biased_begin as usize;
        (offset << Self::CARD_SHIFT) as _
    }

    pub fn is_valid_card(&self, card_addr: *const u8) -> bool {
        let begin = self.mem_map_begin() as usize + self.offset;
        let end = self.mem_map_begin() as usize + self.mem_map_size();
        (begin..end).contains(&(card_addr as usize))
    }

    #[inline]
    pub fn get_card(&self, addr: *const u8) -> u8 {
        unsafe { *self.card_from_addr(addr) }
    }

    #[inline]
    pub fn is_dirty(&self, addr: *const u8) -> bool {
        self.get_card(addr) == Self::CARD_DIRTY
    }

    #[inline]
    pub fn is_clean(&self, addr: *const u8) -> bool {
        self.get_card(addr) == Self::CARD_CLEAN
    }

    #[inline]
    pub fn mark_card(&self, addr: *const u8) {
        unsafe {
            *self.card_from_addr(addr) = Self::CARD_DIRTY;
        }
    }

    pub fn clear_card_table(&self) {
        unsafe {
            std::ptr::write_bytes(self.mem_map_begin(), Self::CARD_CLEAN, self.mem_map_size());
        }
    }

    pub fn clear_card_range(&self, begin: *const u8, end: *const u8) {
        let card_begin = self.card_from_addr(begin);
        let card_end = self.card_from_addr(align_up(end as usize, Self::CARD_SIZE) as _);
        unsafe {
            std::ptr::write_bytes(
                card_begin,
                Self::CARD_CLEAN,
                card_end as usize - card_begin as usize,
            );
        }
    }

    /// Visit objects on cards whose value is at least `minimum_age`, using
    /// `bitmap` to find object starts within each such card. Returns the
    /// number of cards scanned.
    pub fn scan<const ALIGN: usize>(
        &self,
        bitmap: &SpaceBitmap<ALIGN>,
        scan_begin: *const u8,
        scan_end: *const u8,
        minimum_age: u8,
        mut visitor: impl FnMut(*mut crate::api::HeapObjectHeader),
    ) -> usize {
        debug_assert!(bitmap.has_address(scan_begin));
        let mut cards_scanned = 0;
        unsafe {
            let mut card_cur = self.card_from_addr(scan_begin);
            let card_end = self.card_from_addr(align_up(scan_end as usize, Self::CARD_SIZE) as _);
            while card_cur < card_end {
                if *card_cur >= minimum_age {
                    let start = self.addr_from_card(card_cur);
                    let end = start.add(Self::CARD_SIZE);
                    bitmap.visit_marked_range(start, end, &mut visitor);
                    cards_scanned += 1;
                }
                card_cur = card_cur.add(1);
            }
        }
        cards_scanned
    }

    /// True when any card covering `[begin, end)` is at least `minimum_age`.
    /// Used to skip dense walks of ranges nothing has written to.
    pub fn range_has_card_at_least(&self, begin: *const u8, end: *const u8, minimum_age: u8) -> bool {
        unsafe {
            let mut card_cur = self.card_from_addr(begin);
            let card_end = self.card_from_addr(align_up(end as usize, Self::CARD_SIZE) as _);
            while card_cur < card_end {
                if *card_cur >= minimum_age {
                    return true;
                }
                card_cur = card_cur.add(1);
            }
        }
        false
    }

    /// CAS-update every card in `[scan_begin, scan_end)` through `visitor`,
    /// reporting each change through `modified`. Runs word-at-a-time in the
    /// aligned middle so concurrent mutator dirtying is never lost.
    #[inline]
    pub fn modify_cards_atomic(
        &self,
        scan_begin: *mut u8,
        scan_end: *mut u8,
        mut visitor: impl FnMut(u8) -> u8,
        mut modified: impl FnMut(*mut u8, u8, u8),
    ) {
        unsafe {
            let mut card_cur = self.card_from_addr(scan_begin);
            let mut card_end =
                self.card_from_addr(align_up(scan_end as usize, Self::CARD_SIZE) as _);

            while !is_aligned(card_cur as _, size_of::<usize>()) && card_cur < card_end {
                let mut expected;
                let mut new_value;
                while {
                    expected = *card_cur;
                    new_value = visitor(expected);
                    expected != new_value && !byte_cas(expected, new_value, card_cur)
                } {}
                if expected != new_value {
                    modified(card_cur, expected, new_value);
                }
                card_cur = card_cur.add(1);
            }
            while !is_aligned(card_end as _, size_of::<usize>()) && card_end > card_cur {
                card_end = card_end.sub(1);
                let mut expected;
                let mut new_value;
                while {
                    expected = *card_end;
                    new_value = visitor(expected);
                    expected != new_value && !byte_cas(expected, new_value, card_end)
                } {}
                if expected != new_value {
                    modified(card_end, expected, new_value);
                }
            }

            let mut word_cur = card_cur.cast::<usize>();
            let word_end = card_end.cast::<usize>();

            union U1 {
                expected_word: usize,
                expected_bytes: [u8; size_of::<usize>()],
            }

            union U2 {
                new_word: usize,
                new_bytes: [u8; size_of::<usize>()],
            }

            let mut u1 = U1 { expected_word: 0 };
            let mut u2 = U2 { new_word: 0 };
            while word_cur < word_end {
                loop {
                    u1.expected_word = *word_cur;
                    if u1.expected_word == 0 {
                        break; // clean cards
                    }
                    for i in 0..size_of::<usize>() {
                        u2.new_bytes[i] = visitor(u1.expected_bytes[i]);
                    }
                    let atomic_word = word_cur.cast::<AtomicUsize>();
                    if (*atomic_word)
                        .compare_exchange_weak(
                            u1.expected_word,
                            u2.new_word,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        for i in 0..size_of::<usize>() {
                            let expected_byte = u1.expected_bytes[i];
                            let new_byte = u2.new_bytes[i];
                            if new_byte != expected_byte {
                                modified(word_cur.cast::<u8>().add(i), expected_byte, new_byte);
                            }
                        }
                        break;
                    }
                }
                word_cur = word_cur.add(1);
            }
        }
    }
}

unsafe impl Send for CardTable {}
unsafe impl Sync for CardTable {}
