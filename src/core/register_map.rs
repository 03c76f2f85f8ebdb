//! Register model: named parameters grouped by physical register address
//!
//! A [`RegisterMap`] is built once from a device's configured register table
//! and owned exclusively by that device. Its address set never changes after
//! construction; only parameter values mutate, and only from inside the
//! owning worker context.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::RegisterConfig;
use crate::utils::error::{GatewayError, Result};

/// Modbus register table kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
    /// Unrecognized regtype string in the configuration
    #[serde(other)]
    Invalid,
}

impl RegisterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coil => "coil",
            Self::DiscreteInput => "discrete_input",
            Self::InputRegister => "input_register",
            Self::HoldingRegister => "holding_register",
            Self::Invalid => "invalid",
        }
    }
}

/// Parameter access mode, derived from the free-text `access` field by
/// substring test ("read" / "write").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// Derive the mode from a free-text access description. Anything without
    /// "write" in it is treated as read-only.
    pub fn from_text(text: &str) -> Self {
        let has_read = text.contains("read");
        let has_write = text.contains("write");
        match (has_read, has_write) {
            (_, false) => Self::Read,
            (true, true) => Self::ReadWrite,
            (false, true) => Self::Write,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// A named, independently addressable sub-field of a register, or an entire
/// multi-register value.
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Register (or coil) address after the device's address offset
    pub address: u16,
    /// Globally unique key
    pub key: String,
    /// Human-readable display name
    pub name: String,
    /// Field width in bits: 1..=16, 32 or 64
    pub bit_length: u16,
    /// Field offset within the register, LSB = 0
    pub bit_offset: u16,
    /// Derived access mode
    pub access: AccessMode,
    /// Register table this parameter lives in
    pub kind: RegisterKind,
    /// Current value; width implied by `bit_length`
    pub value: u64,
}

/// One or more parameters physically co-located in one or more consecutive
/// registers, polled or written as a unit.
#[derive(Debug, Clone)]
pub struct RegisterGroup {
    pub address: u16,
    /// 1 unless a member is 32-bit (2) or 64-bit (4) wide
    pub register_count: u16,
    /// False iff any member parameter is writable
    pub is_read: bool,
    pub kind: RegisterKind,
    /// Multiple members only when `register_count == 1`
    pub members: Vec<Parameter>,
}

impl RegisterGroup {
    /// Register count implied by the widest member.
    fn count_for(bit_length: u16) -> u16 {
        match bit_length {
            64 => 4,
            32 => 2,
            _ => 1,
        }
    }
}

/// Contiguous address span covering every group of one register kind,
/// exposed to the transport collaborator as a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpan {
    pub kind: RegisterKind,
    pub start: u16,
    /// Number of registers in the span (inclusive of gaps between groups)
    pub count: u16,
}

/// Snapshot of one group queued for transmission.
#[derive(Debug, Clone, Copy)]
pub struct PollRequest {
    pub address: u16,
    pub register_count: u16,
    pub is_read: bool,
    pub kind: RegisterKind,
}

/// Address-keyed register groups with a key reverse index and deterministic
/// polling order (configuration order of first appearance).
#[derive(Debug, Default)]
pub struct RegisterMap {
    groups: HashMap<u16, RegisterGroup>,
    /// key -> (address, index in group member list)
    key_index: HashMap<String, (u16, usize)>,
    /// Addresses in first-seen configuration order
    order: Vec<u16>,
}

impl RegisterMap {
    /// Build the map from the configured register table. `address_offset` is
    /// added to every configured address (Modbus base-address shift).
    ///
    /// Fails when a key is duplicated, when a wide (32/64-bit) parameter
    /// would share an address with another parameter (wide groups hold
    /// exactly one member), or when the shifted address or the group's last
    /// register would fall outside the 16-bit address space.
    pub fn from_registers(registers: &[RegisterConfig], address_offset: u16) -> Result<Self> {
        let mut map = Self::default();

        for reg in registers {
            let address = reg.address.checked_add(address_offset).ok_or_else(|| {
                GatewayError::config(format!(
                    "register {}: address {} plus offset {address_offset} overflows the address space",
                    reg.key, reg.address
                ))
            })?;
            let param = Parameter {
                address,
                key: reg.key.clone(),
                name: reg.name.clone(),
                bit_length: reg.length,
                bit_offset: reg.bitpos,
                access: AccessMode::from_text(&reg.access),
                kind: reg.regtype,
                value: 0,
            };

            if map.key_index.contains_key(&param.key) {
                return Err(GatewayError::config(format!(
                    "duplicate register key: {}",
                    param.key
                )));
            }

            let register_count = RegisterGroup::count_for(param.bit_length);
            if address.checked_add(register_count - 1).is_none() {
                return Err(GatewayError::config(format!(
                    "register {address}: group extends past the end of the address space (key {})",
                    param.key
                )));
            }

            match map.groups.get_mut(&address) {
                Some(group) => {
                    // Shared addresses only make sense for sub-word fields.
                    if group.register_count != 1 || register_count != 1 {
                        return Err(GatewayError::config(format!(
                            "register {address}: wide groups hold exactly one parameter (key {})",
                            param.key
                        )));
                    }
                    if param.access.is_writable() {
                        group.is_read = false;
                    }
                    group.members.push(param.clone());
                    map.key_index
                        .insert(param.key, (address, group.members.len() - 1));
                },
                None => {
                    let group = RegisterGroup {
                        address,
                        register_count,
                        is_read: !param.access.is_writable(),
                        kind: param.kind,
                        members: vec![param.clone()],
                    };
                    map.groups.insert(address, group);
                    map.order.push(address);
                    map.key_index.insert(param.key, (address, 0));
                },
            }
        }

        Ok(map)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, address: u16) -> Option<&RegisterGroup> {
        self.groups.get(&address)
    }

    pub fn group_mut(&mut self, address: u16) -> Option<&mut RegisterGroup> {
        self.groups.get_mut(&address)
    }

    /// Resolve a key to its (address, index-in-group) pair.
    pub fn key_index_of(&self, key: &str) -> Option<(u16, usize)> {
        self.key_index.get(key).copied()
    }

    /// Look up a parameter by key through the reverse index.
    pub fn parameter(&self, key: &str) -> Option<&Parameter> {
        let &(address, index) = self.key_index.get(key)?;
        self.groups.get(&address)?.members.get(index)
    }

    /// Current value of a keyed parameter.
    pub fn value(&self, key: &str) -> Option<u64> {
        self.parameter(key).map(|p| p.value)
    }

    /// Set a keyed parameter's value. Returns false when the key is absent.
    pub fn set_value(&mut self, key: &str, value: u64) -> bool {
        let Some(&(address, index)) = self.key_index.get(key) else {
            return false;
        };
        if let Some(param) = self
            .groups
            .get_mut(&address)
            .and_then(|g| g.members.get_mut(index))
        {
            param.value = value;
            true
        } else {
            false
        }
    }

    /// One poll request per group, in configuration order. Every group is
    /// included, read and write alike; the scheduler writes the write groups.
    pub fn poll_requests(&self) -> Vec<PollRequest> {
        self.order
            .iter()
            .filter_map(|addr| self.groups.get(addr))
            .map(|g| PollRequest {
                address: g.address,
                register_count: g.register_count,
                is_read: g.is_read,
                kind: g.kind,
            })
            .collect()
    }

    /// One contiguous `[min, max]` address window per register kind present
    /// in the map, covering every group of that kind. Computed once before
    /// the map is exposed to the transport collaborator.
    pub fn spans(&self) -> Vec<RegisterSpan> {
        let mut bounds: HashMap<RegisterKind, (u16, u16)> = HashMap::new();
        for group in self.groups.values() {
            let end = group.address + group.register_count - 1;
            bounds
                .entry(group.kind)
                .and_modify(|(min, max)| {
                    *min = (*min).min(group.address);
                    *max = (*max).max(end);
                })
                .or_insert((group.address, end));
        }
        let mut spans: Vec<RegisterSpan> = bounds
            .into_iter()
            .map(|(kind, (min, max))| RegisterSpan {
                kind,
                start: min,
                count: max - min + 1,
            })
            .collect();
        spans.sort_by_key(|s| (s.kind.as_str(), s.start));
        spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(address: u16, key: &str, length: u16, bitpos: u16, access: &str) -> RegisterConfig {
        RegisterConfig {
            address,
            key: key.to_string(),
            name: key.to_string(),
            length,
            bitpos,
            access: access.to_string(),
            regtype: RegisterKind::HoldingRegister,
            command: None,
        }
    }

    #[test]
    fn test_access_mode_from_text() {
        assert_eq!(AccessMode::from_text("read"), AccessMode::Read);
        assert_eq!(AccessMode::from_text("write"), AccessMode::Write);
        assert_eq!(AccessMode::from_text("readwrite"), AccessMode::ReadWrite);
        assert_eq!(AccessMode::from_text("read only"), AccessMode::Read);
        assert_eq!(AccessMode::from_text(""), AccessMode::Read);
        assert!(AccessMode::from_text("readwrite").is_writable());
        assert!(!AccessMode::from_text("read").is_writable());
    }

    #[test]
    fn test_grouping_shared_register() {
        let map = RegisterMap::from_registers(
            &[reg(100, "a", 8, 0, "read"), reg(100, "b", 8, 8, "read")],
            0,
        )
        .unwrap();

        assert_eq!(map.len(), 1);
        let group = map.group(100).unwrap();
        assert_eq!(group.register_count, 1);
        assert_eq!(group.members.len(), 2);
        assert!(group.is_read);
        assert_eq!(map.key_index_of("a"), Some((100, 0)));
        assert_eq!(map.key_index_of("b"), Some((100, 1)));
    }

    #[test]
    fn test_wide_parameter_register_count() {
        let map = RegisterMap::from_registers(&[reg(10, "wide", 32, 0, "read")], 0).unwrap();
        assert_eq!(map.group(10).unwrap().register_count, 2);

        let map = RegisterMap::from_registers(&[reg(20, "wider", 64, 0, "read")], 0).unwrap();
        assert_eq!(map.group(20).unwrap().register_count, 4);
    }

    #[test]
    fn test_wide_group_single_member_invariant() {
        // A 32-bit parameter cannot share its address with another field.
        let result = RegisterMap::from_registers(
            &[reg(10, "wide", 32, 0, "read"), reg(10, "bit", 1, 0, "read")],
            0,
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));

        let result = RegisterMap::from_registers(
            &[reg(10, "bit", 1, 0, "read"), reg(10, "wide", 32, 0, "read")],
            0,
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let result = RegisterMap::from_registers(
            &[reg(1, "dup", 16, 0, "read"), reg(2, "dup", 16, 0, "read")],
            0,
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_write_member_marks_group() {
        let map = RegisterMap::from_registers(
            &[reg(5, "ro", 8, 0, "read"), reg(5, "rw", 8, 8, "readwrite")],
            0,
        )
        .unwrap();
        assert!(!map.group(5).unwrap().is_read);
    }

    #[test]
    fn test_address_offset() {
        let map = RegisterMap::from_registers(&[reg(100, "x", 16, 0, "read")], 40000).unwrap();
        assert!(map.group(40100).is_some());
        assert_eq!(map.parameter("x").unwrap().address, 40100);
    }

    #[test]
    fn test_poll_order_is_configuration_order() {
        let map = RegisterMap::from_registers(
            &[
                reg(30, "c", 16, 0, "read"),
                reg(10, "a", 16, 0, "read"),
                reg(20, "b", 16, 0, "write"),
            ],
            0,
        )
        .unwrap();
        let requests = map.poll_requests();
        let addresses: Vec<u16> = requests.iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![30, 10, 20]);
        assert!(!requests[2].is_read);
    }

    #[test]
    fn test_span_consolidation() {
        let mut regs = vec![
            reg(100, "h1", 16, 0, "read"),
            reg(110, "h2", 32, 0, "read"), // covers 110..=111
        ];
        let mut coil = reg(3, "c1", 1, 0, "read");
        coil.regtype = RegisterKind::Coil;
        regs.push(coil);

        let map = RegisterMap::from_registers(&regs, 0).unwrap();
        let spans = map.spans();
        assert_eq!(spans.len(), 2);

        let holding = spans
            .iter()
            .find(|s| s.kind == RegisterKind::HoldingRegister)
            .unwrap();
        assert_eq!(holding.start, 100);
        assert_eq!(holding.count, 12); // 100..=111, gaps included

        let coils = spans.iter().find(|s| s.kind == RegisterKind::Coil).unwrap();
        assert_eq!(coils.start, 3);
        assert_eq!(coils.count, 1);
    }

    #[test]
    fn test_groups_bounded_by_address_space() {
        // The last holding register is addressable with a 16-bit value.
        assert!(RegisterMap::from_registers(&[reg(0xFFFF, "last", 16, 0, "read")], 0).is_ok());

        // A wide group starting there would spill past the end.
        let result = RegisterMap::from_registers(&[reg(0xFFFF, "wide", 32, 0, "read")], 0);
        assert!(matches!(result, Err(GatewayError::Config(_))));
        let result = RegisterMap::from_registers(&[reg(0xFFFD, "wider", 64, 0, "read")], 0);
        assert!(matches!(result, Err(GatewayError::Config(_))));

        // An offset must not wrap the shifted address around, which would
        // silently alias another configured register.
        let result = RegisterMap::from_registers(&[reg(0x8000, "x", 16, 0, "read")], 0x8000);
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_set_value() {
        let mut map =
            RegisterMap::from_registers(&[reg(1, "v", 16, 0, "readwrite")], 0).unwrap();
        assert!(map.set_value("v", 42));
        assert_eq!(map.value("v"), Some(42));
        assert!(!map.set_value("missing", 1));
        assert_eq!(map.value("missing"), None);
    }
}
