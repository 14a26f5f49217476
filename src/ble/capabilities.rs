//! Capability predicates over GATT property and permission bitmasks.
//!
//! Bit values follow the Bluetooth Core characteristic properties field
//! and the platform descriptor permission flags. Unknown bits are ignored.

/// Characteristic properties bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// Broadcast.
    pub const BROADCAST: u8 = 0x01;
    /// Read.
    pub const READ: u8 = 0x02;
    /// Write without response.
    pub const WRITE_NO_RESPONSE: u8 = 0x04;
    /// Write with response.
    pub const WRITE: u8 = 0x08;
    /// Notify.
    pub const NOTIFY: u8 = 0x10;
    /// Indicate.
    pub const INDICATE: u8 = 0x20;
    /// Authenticated signed writes.
    pub const SIGNED_WRITE: u8 = 0x40;
    /// Extended properties.
    pub const EXTENDED_PROPERTIES: u8 = 0x80;

    /// Wrap a raw bitmask.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Get the raw bitmask.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether any bit of `property` is set.
    pub const fn contains(&self, property: u8) -> bool {
        self.0 & property != 0
    }

    /// Check if the characteristic can be read.
    pub const fn is_readable(&self) -> bool {
        self.contains(Self::READ)
    }

    /// Check if the characteristic accepts writes with response.
    pub const fn is_writable(&self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Check if the characteristic accepts writes without response.
    pub const fn is_writable_without_response(&self) -> bool {
        self.contains(Self::WRITE_NO_RESPONSE)
    }

    /// Check if the characteristic can notify.
    pub const fn is_notifiable(&self) -> bool {
        self.contains(Self::NOTIFY)
    }

    /// Check if the characteristic can indicate.
    pub const fn is_indicatable(&self) -> bool {
        self.contains(Self::INDICATE)
    }

    /// Notifiable or indicatable.
    pub const fn supports_notifications(&self) -> bool {
        self.is_notifiable() || self.is_indicatable()
    }
}

impl From<u8> for CharacteristicProperties {
    fn from(bits: u8) -> Self {
        Self(bits)
    }
}

/// Descriptor permissions bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DescriptorPermissions(u16);

impl DescriptorPermissions {
    pub const READ: u16 = 0x001;
    pub const READ_ENCRYPTED: u16 = 0x002;
    pub const READ_ENCRYPTED_MITM: u16 = 0x004;
    pub const WRITE: u16 = 0x010;
    pub const WRITE_ENCRYPTED: u16 = 0x020;
    pub const WRITE_ENCRYPTED_MITM: u16 = 0x040;
    pub const WRITE_SIGNED: u16 = 0x080;
    pub const WRITE_SIGNED_MITM: u16 = 0x100;

    const ANY_READ: u16 = Self::READ | Self::READ_ENCRYPTED | Self::READ_ENCRYPTED_MITM;
    const ANY_WRITE: u16 = Self::WRITE
        | Self::WRITE_ENCRYPTED
        | Self::WRITE_ENCRYPTED_MITM
        | Self::WRITE_SIGNED
        | Self::WRITE_SIGNED_MITM;

    /// Wrap a raw bitmask.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Get the raw bitmask.
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Check whether any bit of `permission` is set.
    pub const fn contains(&self, permission: u16) -> bool {
        self.0 & permission != 0
    }

    /// Readable with any protection level.
    pub const fn is_readable(&self) -> bool {
        self.contains(Self::ANY_READ)
    }

    /// Writable with any protection level, signed writes included.
    pub const fn is_writable(&self) -> bool {
        self.contains(Self::ANY_WRITE)
    }
}

impl From<u16> for DescriptorPermissions {
    fn from(bits: u16) -> Self {
        Self(bits)
    }
}
