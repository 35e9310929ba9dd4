/// The guest argument registers `x0..x7` at the time of the trap.
///
/// Handlers read their arguments from here and write their outputs back;
/// the JIT copies the frame into the guest context on return.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct SvcFrame {
    pub x: [u64; 8],
}

impl SvcFrame {
    #[must_use]
    pub const fn new(x: [u64; 8]) -> Self {
        Self { x }
    }

    /// Builds a frame from the leading argument registers, zeroing the rest.
    ///
    /// # Panics
    /// If more than eight arguments are given.
    #[must_use]
    pub fn with_args(args: &[u64]) -> Self {
        assert!(args.len() <= 8, "at most eight argument registers");
        let mut x = [0; 8];
        x[..args.len()].copy_from_slice(args);
        Self { x }
    }

    #[inline]
    #[must_use]
    pub const fn arg(&self, index: usize) -> u64 {
        self.x[index]
    }

    /// Argument `index` as the low 32 bits of its register.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn arg_u32(&self, index: usize) -> u32 {
        self.x[index] as u32
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn arg_i64(&self, index: usize) -> i64 {
        self.x[index] as i64
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub const fn arg_i32(&self, index: usize) -> i32 {
        self.x[index] as i32
    }

    /// The result code in `x0`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn result(&self) -> u32 {
        self.x[0] as u32
    }

    #[inline]
    pub fn set_result(&mut self, code: u32) {
        self.x[0] = u64::from(code);
    }

    /// Writes output register `index` (`x1` and up).
    #[inline]
    pub const fn set_output(&mut self, index: usize, value: u64) {
        self.x[index] = value;
    }
}
