//! Hardware capability queries used to size the debug block.
//!
//! The calculator OS only exposes two flags that matter here: whether the
//! device has a color screen and whether it is a CM-class device. Color
//! devices ship with 64 MiB of RAM except the CM, which keeps the 32 MiB of the
//! grayscale models.

const MIB: usize = 1024 * 1024;

/// Reports the capabilities of the device the OS is running on.
pub trait Hardware {
    /// Returns `true` if the device has a color display.
    fn has_colors(&self) -> bool;

    /// Returns `true` if the device is a CM-class variant.
    fn is_cm(&self) -> bool;
}

/// Color devices other than the CM have 64 MiB of RAM.
fn has_large_ram<H: Hardware + ?Sized>(hardware: &H) -> bool {
    hardware.has_colors() && !hardware.is_cm()
}

impl<H: Hardware + ?Sized> Hardware for &H {
    fn has_colors(&self) -> bool {
        (**self).has_colors()
    }

    fn is_cm(&self) -> bool {
        (**self).is_cm()
    }
}

impl<H: Hardware + ?Sized> Hardware for Box<H> {
    fn has_colors(&self) -> bool {
        (**self).has_colors()
    }

    fn is_cm(&self) -> bool {
        (**self).is_cm()
    }
}

/// A set of capability flags, for when the detected values are already known.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The device has a color display.
    pub has_colors: bool,
    /// The device is a CM-class variant.
    pub is_cm: bool,
}

impl Hardware for Capabilities {
    fn has_colors(&self) -> bool {
        self.has_colors
    }

    fn is_cm(&self) -> bool {
        self.is_cm
    }
}

/// Known calculator models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    /// Original grayscale model with the clickpad keypad.
    Clickpad,
    /// Grayscale model with the touchpad keypad.
    Touchpad,
    /// First color model.
    Cx,
    /// Color model sold with a reduced feature set and 32 MiB of RAM.
    Cm,
    /// Second generation color model.
    CxII,
}

impl Model {
    /// Returns the amount of RAM the model ships with, in bytes.
    #[must_use]
    pub fn ram_size(self) -> usize {
        if has_large_ram(&self) { 64 * MIB } else { 32 * MIB }
    }
}

impl Hardware for Model {
    fn has_colors(&self) -> bool {
        matches!(self, Self::Cx | Self::Cm | Self::CxII)
    }

    fn is_cm(&self) -> bool {
        matches!(self, Self::Cm)
    }
}

/// Decides how large the debug block is.
///
/// The block has to fit any program the loader may be asked to place in it,
/// so it takes a fixed share of the device's RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizing {
    /// Block size on devices with 64 MiB of RAM.
    pub large: usize,
    /// Block size on every other device.
    pub small: usize,
}

impl BlockSizing {
    /// 12 MiB on 64 MiB devices, 8 MiB otherwise.
    pub const DEFAULT: Self = Self {
        large: 12 * MIB,
        small: 8 * MIB,
    };

    /// Returns the block size for the given device.
    #[must_use]
    pub fn for_hardware<H: Hardware + ?Sized>(&self, hardware: &H) -> usize {
        if has_large_ram(hardware) {
            self.large
        } else {
            self.small
        }
    }
}

impl Default for BlockSizing {
    fn default() -> Self {
        Self::DEFAULT
    }
}
