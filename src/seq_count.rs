use crate::{MAX_SEQ_COUNT, NUM_APIDS};
use core::cell::Cell;
use delegate::delegate;
use paste::paste;

/// Core trait for objects which can provide a sequence count.
///
/// The functions are not mutable so that counters can be kept behind shared references using
/// interior mutability.
pub trait SequenceCountProvider {
    type Raw: Into<u64>;
    const MAX_BIT_WIDTH: usize;

    fn get(&self) -> Self::Raw;

    fn increment(&self);

    fn get_and_increment(&self) -> Self::Raw {
        let val = self.get();
        self.increment();
        val
    }
}

/// Counter which wraps to zero after reaching a configured maximum value.
#[derive(Debug, Clone)]
pub struct WrappingSeqCounter<T: Copy> {
    seq_count: Cell<T>,
    max_val: T,
}

macro_rules! wrapping_counter_impl {
    ($($ty: ident,)+) => {
        $(
            paste! {
                impl WrappingSeqCounter<$ty> {
                    pub fn [<new_with_max_val_ $ty>](max_val: $ty) -> Self {
                        Self {
                            seq_count: Cell::new(0),
                            max_val,
                        }
                    }
                }

                impl SequenceCountProvider for WrappingSeqCounter<$ty> {
                    type Raw = $ty;
                    const MAX_BIT_WIDTH: usize = core::mem::size_of::<Self::Raw>() * 8;

                    fn get(&self) -> Self::Raw {
                        self.seq_count.get()
                    }

                    fn increment(&self) {
                        self.get_and_increment();
                    }

                    fn get_and_increment(&self) -> Self::Raw {
                        let curr_count = self.seq_count.get();
                        if curr_count >= self.max_val {
                            self.seq_count.set(0);
                        } else {
                            self.seq_count.set(curr_count + 1);
                        }
                        curr_count
                    }
                }
            }
        )+
    }
}

wrapping_counter_impl!(u16,);

/// Sequence counter for the 14-bit space packet sequence count field, wrapping at
/// [MAX_SEQ_COUNT].
#[derive(Debug, Clone)]
pub struct CcsdsSeqCounter {
    provider: WrappingSeqCounter<u16>,
}

impl Default for CcsdsSeqCounter {
    fn default() -> Self {
        Self {
            provider: WrappingSeqCounter::new_with_max_val_u16(MAX_SEQ_COUNT),
        }
    }
}

impl SequenceCountProvider for CcsdsSeqCounter {
    type Raw = u16;
    const MAX_BIT_WIDTH: usize = 14;
    delegate! {
        to self.provider {
            fn get(&self) -> u16;
            fn increment(&self);
            fn get_and_increment(&self) -> u16;
        }
    }
}

/// One [CcsdsSeqCounter] per APID.
#[derive(Debug, Clone)]
pub struct ApidSeqCounters {
    counters: Vec<CcsdsSeqCounter>,
}

impl Default for ApidSeqCounters {
    fn default() -> Self {
        Self {
            counters: vec![CcsdsSeqCounter::default(); NUM_APIDS],
        }
    }
}

impl ApidSeqCounters {
    /// Returns the current count for the APID and advances it. APIDs are masked to 11 bits.
    pub fn next(&self, apid: u16) -> u16 {
        self.counters[usize::from(apid) % NUM_APIDS].get_and_increment()
    }

    pub fn current(&self, apid: u16) -> u16 {
        self.counters[usize::from(apid) % NUM_APIDS].get()
    }
}

#[cfg(test)]
mod tests {
    use crate::seq_count::{
        ApidSeqCounters, CcsdsSeqCounter, SequenceCountProvider, WrappingSeqCounter,
    };
    use crate::MAX_SEQ_COUNT;

    #[test]
    fn test_u16_counter_custom_max() {
        let counter = WrappingSeqCounter::new_with_max_val_u16(2);
        assert_eq!(counter.get_and_increment(), 0);
        assert_eq!(counter.get_and_increment(), 1);
        assert_eq!(counter.get_and_increment(), 2);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_ccsds_counter() {
        let ccsds_counter = CcsdsSeqCounter::default();
        assert_eq!(ccsds_counter.get(), 0);
        assert_eq!(ccsds_counter.get_and_increment(), 0);
        assert_eq!(ccsds_counter.get_and_increment(), 1);
        assert_eq!(ccsds_counter.get(), 2);
    }

    #[test]
    fn test_ccsds_counter_overflow() {
        let ccsds_counter = CcsdsSeqCounter::default();
        for _ in 0..MAX_SEQ_COUNT + 1 {
            ccsds_counter.increment();
        }
        assert_eq!(ccsds_counter.get(), 0);
    }

    #[test]
    fn test_apid_counters_are_independent() {
        let counters = ApidSeqCounters::default();
        assert_eq!(counters.next(5), 0);
        assert_eq!(counters.next(5), 1);
        assert_eq!(counters.next(6), 0);
        assert_eq!(counters.current(5), 2);
        assert_eq!(counters.current(6), 1);
    }
}
