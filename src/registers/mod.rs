use std::collections::{BTreeMap, HashMap};
use std::fmt;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, MeterError};

pub mod catalog;
pub mod decoder;

pub use catalog::{get_register_table, RegisterCatalog};

/// Largest number of registers a single Modbus read may return
pub const MAX_REGISTERS_PER_READ: u16 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    Bitfield16,
    Bitfield32,
}

impl DataType {
    /// Number of 16 bit registers the value occupies
    pub fn words(&self) -> u16 {
        match self {
            DataType::Int16 | DataType::Uint16 | DataType::Bitfield16 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 | DataType::Bitfield32 => 2,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 4,
        }
    }

    pub fn bits(&self) -> u16 {
        self.words() * 16
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, DataType::Int16 | DataType::Int32 | DataType::Int64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    pub fn is_bitfield(&self) -> bool {
        matches!(self, DataType::Bitfield16 | DataType::Bitfield32)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int16 => "int16",
            DataType::Uint16 => "uint16",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Int64 => "int64",
            DataType::Uint64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Bitfield16 => "bitfield16",
            DataType::Bitfield32 => "bitfield32",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order of the bytes of a multi register value, A being the most significant byte.
///
/// `ABCD` is the plain Modbus order: the most significant word comes first and
/// every word is big-endian. `CDAB` sends the least significant word first,
/// `BADC` swaps the bytes inside each word and `DCBA` does both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum ByteOrder {
    #[default]
    #[serde(rename = "ABCD")]
    Abcd,
    #[serde(rename = "CDAB")]
    Cdab,
    #[serde(rename = "BADC")]
    Badc,
    #[serde(rename = "DCBA")]
    Dcba,
}

impl ByteOrder {
    pub fn swaps_words(&self) -> bool {
        matches!(self, ByteOrder::Cdab | ByteOrder::Dcba)
    }

    pub fn swaps_bytes(&self) -> bool {
        matches!(self, ByteOrder::Badc | ByteOrder::Dcba)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    #[default]
    Holding,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Rtu,
    Tcp,
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegisterSpec {
    pub name: String,
    pub address: u16,
    pub length: u16,
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_order: Option<ByteOrder>,
    #[serde(default)]
    pub kind: RegisterKind,
    /* Some devices report 0 for a value that really means something else */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero_value: Option<f64>,
}

impl RegisterSpec {
    pub fn new(name: &str, address: u16, data_type: DataType) -> Self {
        RegisterSpec {
            name: name.to_string(),
            address,
            length: data_type.words(),
            data_type,
            scale: 1.0,
            unit: None,
            byte_order: None,
            kind: RegisterKind::Holding,
            zero_value: None,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = Some(byte_order);
        self
    }

    pub fn with_kind(mut self, kind: RegisterKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_zero_value(mut self, value: f64) -> Self {
        self.zero_value = Some(value);
        self
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order.unwrap_or_default()
    }

    /// First register after this one
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.length)
    }
}

fn default_max_registers() -> u16 { MAX_REGISTERS_PER_READ }
fn default_max_gap() -> u16 { 0 }

/// Limits used when several registers are fetched with one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Batching {
    #[serde(default = "default_max_registers")]
    pub max_registers: u16,
    /* registers between two wanted values that may be read and thrown away */
    #[serde(default = "default_max_gap")]
    pub max_gap: u16,
}

impl Default for Batching {
    fn default() -> Self {
        Batching { max_registers: default_max_registers(), max_gap: default_max_gap() }
    }
}

fn defaults_slave_id() -> u8 { 1 }
fn defaults_baudrate() -> u32 { 38400 }
fn defaults_tcp_port() -> u16 { 502 }
fn defaults_timeout_ms() -> u64 { 500 }

/// Connection parameters used when the meter config does not name them
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectionDefaults {
    #[serde(default = "defaults_slave_id")]
    pub slave_id: u8,
    #[serde(default = "defaults_baudrate")]
    pub baudrate: u32,
    #[serde(default = "defaults_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "defaults_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        ConnectionDefaults {
            slave_id: defaults_slave_id(),
            baudrate: defaults_baudrate(),
            tcp_port: defaults_tcp_port(),
            timeout_ms: defaults_timeout_ms(),
        }
    }
}

/// A register holding a scale code which selects the decimals of other registers
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DynamicScale {
    pub source: String,
    pub targets: Vec<String>,
    pub decimals: BTreeMap<i64, i32>,
}

impl DynamicScale {
    pub fn scale_for(&self, code: i64) -> Option<f64> {
        self.decimals.get(&code).map(|d| {
            if *d >= 0 { 1.0 / 10f64.powi(*d) } else { 10f64.powi(-*d) }
        })
    }
}

#[derive(Debug, Clone)]
pub struct RegisterTable {
    model: String,
    manufacturer: String,
    registers: Vec<RegisterSpec>,
    index: HashMap<String, usize>,
    nulls: BTreeMap<u16, Vec<i128>>,
    register_offset: u16,
    batching: Batching,
    defaults: ConnectionDefaults,
    transport: TransportKind,
    dynamic_scales: Vec<DynamicScale>,
}

impl RegisterTable {
    pub fn new(model: &str, registers: Vec<RegisterSpec>) -> Result<Self, MeterError> {
        let mut index = HashMap::with_capacity(registers.len());
        for (i, reg) in registers.iter().enumerate() {
            if reg.length != reg.data_type.words() {
                return Err(MeterError::config(format!(
                    "{model}: register {} is {} but has length {}",
                    reg.name, reg.data_type, reg.length
                )));
            }
            if u32::from(reg.address) + u32::from(reg.length) > 0x1_0000 {
                return Err(MeterError::config(format!(
                    "{model}: register {} at {} runs past the end of the address space",
                    reg.name, reg.address
                )));
            }
            if index.insert(reg.name.clone(), i).is_some() {
                return Err(MeterError::config(format!("{model}: register {} is defined twice", reg.name)));
            }
        }

        return Ok(RegisterTable {
            model: model.to_string(),
            manufacturer: String::new(),
            registers,
            index,
            nulls: BTreeMap::new(),
            register_offset: 0,
            batching: Batching::default(),
            defaults: ConnectionDefaults::default(),
            transport: TransportKind::default(),
            dynamic_scales: Vec::new(),
        });
    }

    pub fn with_manufacturer(mut self, manufacturer: &str) -> Self {
        self.manufacturer = manufacturer.to_string();
        self
    }

    /// Nulls are raw values, keyed by register width in bits, that mean "not available"
    pub fn with_nulls(mut self, nulls: BTreeMap<u16, Vec<i128>>) -> Self {
        self.nulls = nulls;
        self
    }

    pub fn with_defaults(mut self, transport: TransportKind, defaults: ConnectionDefaults) -> Self {
        self.transport = transport;
        self.defaults = defaults;
        self
    }

    pub fn with_register_offset(mut self, offset: u16) -> Result<Self, MeterError> {
        if let Some(reg) = self.registers.iter().find(|r| r.address < offset) {
            return Err(MeterError::config(format!(
                "{}: register {} lies below the register offset {offset}",
                self.model, reg.name
            )));
        }
        self.register_offset = offset;
        Ok(self)
    }

    pub fn with_batching(mut self, batching: Batching) -> Result<Self, MeterError> {
        if batching.max_registers == 0 || batching.max_registers > MAX_REGISTERS_PER_READ {
            return Err(MeterError::config(format!(
                "{}: max_registers must be between 1 and {MAX_REGISTERS_PER_READ}",
                self.model
            )));
        }
        self.batching = batching;
        Ok(self)
    }

    pub fn with_dynamic_scales(mut self, scales: Vec<DynamicScale>) -> Result<Self, MeterError> {
        for scale in scales.iter() {
            for name in std::iter::once(&scale.source).chain(scale.targets.iter()) {
                if !self.contains(name) {
                    return Err(MeterError::config(format!(
                        "{}: dynamic scale refers to unknown register {name}",
                        self.model
                    )));
                }
            }
        }
        self.dynamic_scales = scales;
        Ok(self)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn registers(&self) -> &[RegisterSpec] {
        &self.registers
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registers.iter().map(|r| r.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&RegisterSpec, MeterError> {
        match self.index.get(name) {
            Some(i) => Ok(&self.registers[*i]),
            None => Err(MeterError::UnknownField(name.to_string())),
        }
    }

    pub fn batching(&self) -> Batching {
        self.batching
    }

    pub fn defaults(&self) -> &ConnectionDefaults {
        &self.defaults
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn dynamic_scales(&self) -> &[DynamicScale] {
        &self.dynamic_scales
    }

    pub fn register_offset(&self) -> u16 {
        self.register_offset
    }

    /// Address put on the wire for a register of this table
    pub fn wire_address(&self, spec: &RegisterSpec) -> u16 {
        spec.address - self.register_offset
    }

    pub fn is_null(&self, spec: &RegisterSpec, raw: i128) -> bool {
        match self.nulls.get(&spec.data_type.bits()) {
            Some(patterns) => patterns.contains(&raw),
            None => false,
        }
    }

    /// Decode the words of one register, `None` if the meter reports the value as not available
    pub fn decode(&self, spec: &RegisterSpec, words: &[u16]) -> Result<Option<f64>, MeterError> {
        let wrap = |source| MeterError::Decode { name: spec.name.clone(), source };

        if let decoder::RawValue::Integer(raw) = decoder::combine(words, spec).map_err(wrap)? {
            if self.is_null(spec, raw) {
                debug!("{}: register {} reports no value ({raw})", self.model, spec.name);
                return Ok(None);
            }
        }

        return decoder::decode(words, spec).map(Some).map_err(wrap);
    }

    /// Sub table with only the named registers, in table order
    pub fn restrict<S: AsRef<str>>(&self, model: &str, names: &[S]) -> Result<RegisterTable, MeterError> {
        for name in names {
            self.get(name.as_ref())?;
        }

        let registers = self.registers.iter()
            .filter(|r| names.iter().any(|n| n.as_ref() == r.name))
            .cloned()
            .collect();

        let scales = self.dynamic_scales.iter()
            .filter(|s| names.iter().any(|n| n.as_ref() == s.source))
            .map(|s| {
                let mut s = s.clone();
                s.targets.retain(|t| names.iter().any(|n| n.as_ref() == t.as_str()));
                s
            })
            .collect();

        let mut table = RegisterTable::new(model, registers)?;
        table.manufacturer = self.manufacturer.clone();
        table.nulls = self.nulls.clone();
        table.register_offset = self.register_offset;
        table.batching = self.batching;
        table.defaults = self.defaults.clone();
        table.transport = self.transport;
        table.dynamic_scales = scales;
        return Ok(table);
    }

    /// Copy of the table with a new scale for the given registers
    pub fn rescaled<S: AsRef<str>>(&self, targets: &[S], scale: f64) -> Result<RegisterTable, MeterError> {
        let mut table = self.clone();
        for name in targets {
            let i = match table.index.get(name.as_ref()) {
                Some(i) => *i,
                None => return Err(MeterError::UnknownField(name.as_ref().to_string())),
            };
            table.registers[i].scale = scale;
        }
        Ok(table)
    }
}
