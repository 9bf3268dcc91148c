use bitflags::bitflags;
use uuid::Uuid;

use crate::AttributeHandle;

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const RELIABLE_WRITES = 0x100;
        const WRITABLE_AUXILIARIES = 0x200;
    }
}

bitflags! {
    /// Access permissions of a characteristic or descriptor (as reported by, or
    /// configured on, the native stack)
    pub struct Permissions: u32 {
        const NONE = 0;

        const READ = 0x01;
        const READ_ENCRYPTED = 0x02;
        const READ_ENCRYPTED_MITM = 0x04;
        const WRITE = 0x10;
        const WRITE_ENCRYPTED = 0x20;
        const WRITE_ENCRYPTED_MITM = 0x40;
        const WRITE_SIGNED = 0x80;
        const WRITE_SIGNED_MITM = 0x100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl WriteType {
    pub fn from_response_required(response_required: bool) -> Self {
        if response_required {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Primary,
    Secondary,
}

impl ServiceType {
    /// Maps the numeric service type used by server configurations
    /// (0 = primary, 1 = secondary)
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ServiceType::Primary),
            1 => Some(ServiceType::Secondary),
            _ => None,
        }
    }
}

// What a caller gets back when enumerating a connection's attributes. The
// handles are only valid until the next successful service discovery on the
// same connection (or until the connection is closed).

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub handle: AttributeHandle,
    pub uuid: Uuid,
    pub service_type: ServiceType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub handle: AttributeHandle,
    pub uuid: Uuid,
    pub permissions: Permissions,
    pub properties: CharacteristicProperties,
    pub write_type: WriteType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub handle: AttributeHandle,
    pub uuid: Uuid,
    pub permissions: Permissions,
}
