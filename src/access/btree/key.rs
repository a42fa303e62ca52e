use std::fmt::Debug;

/// A fixed-width, totally ordered index key.
///
/// The tree and its page codecs are generic over this trait; the width
/// decides the on-page entry layout, so it must be one of the supported
/// sizes (4, 8, 16, 32 or 64 bytes) and constant for the type.
pub trait IndexKey: Copy + Ord + Debug + Send + Sync + 'static {
    /// Encoded byte width of the key on a page.
    const WIDTH: usize;

    /// Encodes the key into `buf` (exactly `WIDTH` bytes).
    fn write_to(&self, buf: &mut [u8]);

    /// Decodes a key from `buf` (exactly `WIDTH` bytes).
    fn read_from(buf: &[u8]) -> Self;
}

macro_rules! int_index_key {
    ($($ty:ty),*) => {
        $(
            impl IndexKey for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn write_to(&self, buf: &mut [u8]) {
                    buf[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
                }

                fn read_from(buf: &[u8]) -> Self {
                    <$ty>::from_le_bytes(buf[..Self::WIDTH].try_into().unwrap())
                }
            }
        )*
    };
}

int_index_key!(i32, u32, i64, u64);

macro_rules! array_index_key {
    ($($n:literal),*) => {
        $(
            impl IndexKey for [u8; $n] {
                const WIDTH: usize = $n;

                fn write_to(&self, buf: &mut [u8]) {
                    buf[..$n].copy_from_slice(self);
                }

                fn read_from(buf: &[u8]) -> Self {
                    buf[..$n].try_into().unwrap()
                }
            }
        )*
    };
}

array_index_key!(16, 32, 64);
