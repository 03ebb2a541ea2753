//! Size classes, pointer shapes and buffer growth policy.
//!
//! Small objects are rounded up to one of [`NUM_SIZE_CLASSES`] cell sizes.
//! Every class is split into two span classes by pointer shape, so that the
//! collector never has to look inside pointer-free objects and a reused cell
//! always keeps the shape it was carved with.

/// Block size: 16KB. Blocks are also the unit of large-object allocation.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// log2 of [`BLOCK_SIZE`].
pub const BLOCK_SHIFT: u32 = BLOCK_SIZE.trailing_zeros();

/// Cell sizes for segregated allocation. Covers 16 bytes to 8KB.
const SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = [
    16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 1024, 2048, 4096, 8192,
];

/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = 14;

/// Number of span classes (size class x pointer shape).
pub const NUM_SPAN_CLASSES: usize = NUM_SIZE_CLASSES * 2;

/// Objects bigger than this are carved as a run of whole blocks.
pub const LARGE_OBJECT_THRESHOLD: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1];

/// Whether an object may contain heap pointers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerShape {
    /// Contains pointers; scanned by the collector.
    Scan = 0,
    /// Opaque bytes; never scanned.
    NoScan = 1,
}

impl PointerShape {
    /// True for [`PointerShape::Scan`].
    #[inline]
    pub fn is_scan(self) -> bool {
        self == PointerShape::Scan
    }

    pub(crate) fn from_bits(bits: u8) -> Self {
        if bits == 0 {
            PointerShape::Scan
        } else {
            PointerShape::NoScan
        }
    }
}

/// Index into the size-class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SizeClass(u8);

impl SizeClass {
    /// Smallest class that fits `size` bytes, or `None` for large objects.
    ///
    /// Zero-byte requests map to the smallest class.
    #[inline]
    pub fn for_size(size: usize) -> Option<SizeClass> {
        SIZE_CLASSES
            .iter()
            .position(|&sc| sc >= size)
            .map(|idx| SizeClass(idx as u8))
    }

    /// Class by table index.
    pub fn from_index(index: usize) -> Option<SizeClass> {
        (index < NUM_SIZE_CLASSES).then_some(SizeClass(index as u8))
    }

    /// Table index of this class.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Cell size in bytes.
    #[inline]
    pub fn size(self) -> usize {
        SIZE_CLASSES[self.0 as usize]
    }

    /// Iterate over every class, smallest first.
    pub fn all() -> impl Iterator<Item = SizeClass> {
        (0..NUM_SIZE_CLASSES).map(|i| SizeClass(i as u8))
    }
}

/// A size class paired with a pointer shape. One free list per span class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanClass(u8);

impl SpanClass {
    /// Combine a class and a shape.
    #[inline]
    pub fn new(class: SizeClass, shape: PointerShape) -> Self {
        SpanClass(class.0 * 2 + shape as u8)
    }

    /// Dense index in `0..NUM_SPAN_CLASSES`.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The size class.
    #[inline]
    pub fn size_class(self) -> SizeClass {
        SizeClass(self.0 / 2)
    }

    /// The pointer shape.
    #[inline]
    pub fn shape(self) -> PointerShape {
        PointerShape::from_bits(self.0 & 1)
    }
}

/// Bytes actually reserved for a request of `size` bytes: the class size for
/// small objects, whole blocks for large ones.
#[inline]
pub fn rounded_size(size: usize) -> usize {
    match SizeClass::for_size(size) {
        Some(class) => class.size(),
        None => size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE,
    }
}

/// Capacity threshold where doubling gives way to 1.25x growth.
const GROWTH_THRESHOLD: usize = 256;

/// Element capacity for a buffer growing from `old_cap` to hold at least
/// `new_len` elements of `elem_size` bytes.
///
/// Doubles small buffers, grows large ones by roughly 1.25x, and then rounds
/// the byte size up to the reserved size so the slack is usable.
///
/// # Panics
/// Panics on capacity overflow.
pub fn next_capacity(old_cap: usize, new_len: usize, elem_size: usize) -> usize {
    debug_assert!(elem_size > 0);
    let doubled = old_cap.saturating_mul(2);
    let mut new_cap = old_cap;
    if new_len > doubled {
        new_cap = new_len;
    } else if old_cap < GROWTH_THRESHOLD {
        new_cap = doubled;
    } else {
        while new_cap < new_len {
            new_cap += (new_cap + 3 * GROWTH_THRESHOLD) >> 2;
        }
    }
    let new_cap = new_cap.max(new_len).max(1);

    let bytes = new_cap
        .checked_mul(elem_size)
        .filter(|&b| b <= isize::MAX as usize)
        .expect("capacity overflow");
    rounded_size(bytes) / elem_size
}
