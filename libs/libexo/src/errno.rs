//! Kernel error numbers
//!
//! The exokernel reports failures as small negative integers. These are the
//! values it uses; they are not POSIX errno values.

use core::fmt;

/// Error numbers returned by kernel primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Errno {
    /// Unspecified or unknown problem
    EUNSPEC = 1,
    /// Environment doesn't exist or otherwise cannot be used in requested action
    EBADENV = 2,
    /// Invalid parameter
    EINVAL = 3,
    /// Request failed due to memory shortage
    ENOMEM = 4,
    /// Attempt to create a new environment beyond the maximum allowed
    ENOFREEENV = 5,
    /// Memory fault
    EFAULT = 6,
}

impl Errno {
    /// The negative value a raw entry point returns for this error.
    pub const fn code(self) -> i32 {
        -(self as i32)
    }

    fn describe(self) -> &'static str {
        match self {
            Errno::EUNSPEC => "unspecified error",
            Errno::EBADENV => "bad environment",
            Errno::EINVAL => "invalid parameter",
            Errno::ENOMEM => "out of memory",
            Errno::ENOFREEENV => "out of environments",
            Errno::EFAULT => "segmentation fault",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negated_numbers() {
        assert_eq!(Errno::ENOMEM.code(), -4);
        assert_eq!(Errno::ENOFREEENV.code(), -5);
    }

    #[test]
    fn display_names_the_failure() {
        assert_eq!(format!("{}", Errno::ENOFREEENV), "out of environments");
        assert_eq!(format!("{}", Errno::EINVAL), "invalid parameter");
    }
}
