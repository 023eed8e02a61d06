use xorpir_core::{
    bit_mask, selection_len, xor_all, LayoutError, Record, SelectionVector, ShardLayout,
    SELECTION_GRANULARITY,
};
use xorpir_storage::RecordStore;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    SelectionLengthMismatch { expected: usize, actual: usize },
    LayoutMismatch { layout_records: usize, store_records: usize },
    Layout(LayoutError),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::SelectionLengthMismatch { expected, actual } => {
                write!(
                    f,
                    "selection vector has {} bytes, store needs {}",
                    actual, expected
                )
            }
            ScanError::LayoutMismatch {
                layout_records,
                store_records,
            } => {
                write!(
                    f,
                    "shard layout covers {} records, store has {}",
                    layout_records, store_records
                )
            }
            ScanError::Layout(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::Layout(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LayoutError> for ScanError {
    fn from(err: LayoutError) -> Self {
        ScanError::Layout(err)
    }
}

/// XOR of every record of `store` selected by `selection`.
///
/// Uses the AVX2 kernel when built with the `avx2` feature and the CPU
/// supports it, the portable 8-accumulator kernel otherwise.
pub fn reduce(store: &RecordStore, selection: &SelectionVector) -> Result<Record, ScanError> {
    reduce_records(store.records(), selection.as_bytes())
}

/// Same as [`reduce`] over a raw record slice and packed selection bytes.
pub fn reduce_records(records: &[Record], selection: &[u8]) -> Result<Record, ScanError> {
    check_selection(records, selection)?;
    if avx2_available() {
        // SAFETY: AVX2 support was checked at runtime.
        Ok(unsafe { reduce_avx2(records, selection) })
    } else {
        Ok(reduce_portable_unchecked(records, selection))
    }
}

pub fn reduce_portable(
    store: &RecordStore,
    selection: &SelectionVector,
) -> Result<Record, ScanError> {
    check_selection(store.records(), selection.as_bytes())?;
    Ok(reduce_portable_unchecked(
        store.records(),
        selection.as_bytes(),
    ))
}

/// Bit-at-a-time reference with a single accumulator.
pub fn reduce_scalar(store: &RecordStore, selection: &SelectionVector) -> Result<Record, ScanError> {
    check_selection(store.records(), selection.as_bytes())?;
    Ok(reduce_scalar_unchecked(
        store.records(),
        selection.as_bytes(),
    ))
}

/// One independent reduction per selection, in order.
///
/// Every selection is validated before any work starts.
pub fn reduce_batch(
    store: &RecordStore,
    selections: &[SelectionVector],
) -> Result<Vec<Record>, ScanError> {
    reduce_batch_with(store, selections, |records, bytes| {
        if avx2_available() {
            // SAFETY: AVX2 support was checked at runtime.
            unsafe { reduce_avx2(records, bytes) }
        } else {
            reduce_portable_unchecked(records, bytes)
        }
    })
}

/// [`reduce_batch`] with the single-accumulator reference kernel.
pub fn reduce_batch_scalar(
    store: &RecordStore,
    selections: &[SelectionVector],
) -> Result<Vec<Record>, ScanError> {
    reduce_batch_with(store, selections, reduce_scalar_unchecked)
}

fn reduce_batch_with<F>(
    store: &RecordStore,
    selections: &[SelectionVector],
    kernel: F,
) -> Result<Vec<Record>, ScanError>
where
    F: Fn(&[Record], &[u8]) -> Record + Sync,
{
    for selection in selections {
        check_selection(store.records(), selection.as_bytes())?;
    }

    #[cfg(feature = "parallel")]
    let iter = selections.par_iter();
    #[cfg(not(feature = "parallel"))]
    let iter = selections.iter();

    Ok(iter
        .map(|selection| kernel(store.records(), selection.as_bytes()))
        .collect())
}

/// Reduces every shard of `layout` with its partitioned selection and XORs the
/// partials, the CPU mirror of the accelerator path.
pub fn reduce_sharded(
    store: &RecordStore,
    layout: &ShardLayout,
    selection: &SelectionVector,
) -> Result<Record, ScanError> {
    if layout.total_records() != store.len() {
        return Err(ScanError::LayoutMismatch {
            layout_records: layout.total_records(),
            store_records: store.len(),
        });
    }
    check_selection(store.records(), selection.as_bytes())?;

    let parts = layout.partition(selection)?;
    let mut acc = Record::ZERO;
    for (unit, part) in parts.iter().enumerate() {
        let shard = store.shard(layout, unit);
        let bytes = &part.as_bytes()[..selection_len(shard.len())];
        acc ^= reduce_records(shard, bytes)?;
    }
    Ok(acc)
}

fn check_selection(records: &[Record], selection: &[u8]) -> Result<(), ScanError> {
    let expected = selection_len(records.len());
    if selection.len() != expected {
        return Err(ScanError::SelectionLengthMismatch {
            expected,
            actual: selection.len(),
        });
    }
    Ok(())
}

fn reduce_scalar_unchecked(records: &[Record], selection: &[u8]) -> Record {
    let mut acc = Record::ZERO;
    for (i, record) in records.iter().enumerate() {
        acc.xor_masked(
            record,
            bit_mask(
                selection[i / SELECTION_GRANULARITY],
                i % SELECTION_GRANULARITY,
            ),
        );
    }
    acc
}

fn reduce_portable_unchecked(records: &[Record], selection: &[u8]) -> Record {
    let mut acc = [Record::ZERO; SELECTION_GRANULARITY];
    let groups = records.chunks_exact(SELECTION_GRANULARITY);
    let tail = groups.remainder();

    for (group, &byte) in groups.zip(selection) {
        for (k, record) in group.iter().enumerate() {
            acc[k].xor_masked(record, bit_mask(byte, k));
        }
    }
    if let Some(&byte) = selection.get(records.len() / SELECTION_GRANULARITY) {
        for (k, record) in tail.iter().enumerate() {
            acc[k].xor_masked(record, bit_mask(byte, k));
        }
    }

    xor_all(acc.iter())
}

#[cfg(all(feature = "avx2", target_arch = "x86_64"))]
#[target_feature(enable = "avx2")]
unsafe fn reduce_avx2(records: &[Record], selection: &[u8]) -> Record {
    use std::arch::x86_64::{
        __m256i, _mm256_and_si256, _mm256_load_si256, _mm256_set1_epi64x, _mm256_setzero_si256,
        _mm256_storeu_si256, _mm256_xor_si256,
    };

    let mut acc = [_mm256_setzero_si256(); SELECTION_GRANULARITY];
    let groups = records.chunks_exact(SELECTION_GRANULARITY);
    let tail = groups.remainder();

    for (group, &byte) in groups.zip(selection) {
        for (k, record) in group.iter().enumerate() {
            let mask = _mm256_set1_epi64x(bit_mask(byte, k) as i64);
            // Record is 32-byte aligned.
            let value = _mm256_load_si256(record.words.as_ptr() as *const __m256i);
            acc[k] = _mm256_xor_si256(acc[k], _mm256_and_si256(value, mask));
        }
    }

    let mut total = acc[0];
    for lane in &acc[1..] {
        total = _mm256_xor_si256(total, *lane);
    }
    let mut out = Record::ZERO;
    _mm256_storeu_si256(out.words.as_mut_ptr() as *mut __m256i, total);

    if let Some(&byte) = selection.get(records.len() / SELECTION_GRANULARITY) {
        for (k, record) in tail.iter().enumerate() {
            out.xor_masked(record, bit_mask(byte, k));
        }
    }
    out
}

#[cfg(not(all(feature = "avx2", target_arch = "x86_64")))]
unsafe fn reduce_avx2(records: &[Record], selection: &[u8]) -> Record {
    reduce_portable_unchecked(records, selection)
}

fn avx2_available() -> bool {
    #[cfg(all(feature = "avx2", target_arch = "x86_64"))]
    {
        std::is_x86_feature_detected!("avx2")
    }

    #[cfg(not(all(feature = "avx2", target_arch = "x86_64")))]
    {
        false
    }
}
