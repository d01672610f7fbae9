use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use lazy_static::lazy_static;
use log::{debug, error, info};
use serde::Deserialize;
use serde_yml;
use walkdir::WalkDir;

use crate::error::MeterError;
use super::{Batching, ByteOrder, ConnectionDefaults, DynamicScale, RegisterSpec, RegisterTable, TransportKind};

/* Definitions shipped with the crate, user definitions are loaded with RegisterCatalog::load_dir */
const BUILTIN_DEFINITIONS: [(&str, &str); 4] = [
    ("abb.yaml", include_str!("../../defs/registers/abb.yaml")),
    ("mem001.yaml", include_str!("../../defs/registers/mem001.yaml")),
    ("sma.yaml", include_str!("../../defs/registers/sma.yaml")),
    ("multicube.yaml", include_str!("../../defs/registers/multicube.yaml")),
];

lazy_static! {
    static ref BUILTIN: RegisterCatalog = RegisterCatalog::load_builtin();
}

/// Raw register values are written as plain integers, both signed and up to u64::MAX
#[derive(Deserialize, Clone, Copy)]
#[serde(untagged)]
enum RawInt {
    Signed(i64),
    Unsigned(u64),
}

impl From<RawInt> for i128 {
    fn from(value: RawInt) -> Self {
        match value {
            RawInt::Signed(v) => i128::from(v),
            RawInt::Unsigned(v) => i128::from(v),
        }
    }
}

#[derive(Deserialize)]
struct RegisterFile {
    manufacturer: String,
    model: String,
    #[serde(default)]
    transport: TransportKind,
    #[serde(default)]
    defaults: ConnectionDefaults,
    #[serde(default)]
    register_offset: u16,
    #[serde(default)]
    byte_order: ByteOrder,
    #[serde(default)]
    batching: Batching,
    #[serde(default)]
    nulls: BTreeMap<u16, Vec<RawInt>>,
    #[serde(default)]
    dynamic_scales: Vec<DynamicScale>,
    #[serde(default)]
    variants: BTreeMap<String, Vec<String>>,
    registers: Vec<RegisterSpec>,
}

/// All register tables known to the process, looked up by model name
#[derive(Debug, Clone, Default)]
pub struct RegisterCatalog {
    tables: BTreeMap<String, RegisterTable>,
}

impl RegisterCatalog {
    pub fn new() -> Self {
        RegisterCatalog { tables: BTreeMap::new() }
    }

    /// The definitions compiled into the crate
    pub fn builtin() -> &'static RegisterCatalog {
        &BUILTIN
    }

    fn load_builtin() -> Self {
        let mut catalog = RegisterCatalog::new();
        for (file, contents) in BUILTIN_DEFINITIONS.iter() {
            match parse_definition(contents) {
                Ok(tables) => {
                    for table in tables {
                        catalog.insert(table);
                    }
                }
                Err(e) => {
                    error!("Builtin definition {file} is broken: {e}");
                }
            }
        }
        debug!("Loaded {} builtin register tables", catalog.tables.len());
        return catalog;
    }

    /// Add a table, replacing one with the same model name
    pub fn insert(&mut self, table: RegisterTable) {
        self.tables.insert(table.model().to_lowercase(), table);
    }

    /// Add every *.yaml definition of a directory. User definitions win over builtin ones.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, MeterError> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry
                .map_err(|e| MeterError::config(format!("Unable to read definitions in {}: {e}", dir.display())))?;
            let path = entry.path();
            if entry.file_type().is_file() && path.extension().map_or(false, |ext| ext == "yaml" || ext == "yml") {
                paths.push(path.to_path_buf());
            }
        }

        let mut count = 0;
        for path in paths {
            let contents = fs::read_to_string(&path)
                .map_err(|e| MeterError::config(format!("Unable to read {}: {e}", path.display())))?;
            let tables = parse_definition(&contents)
                .map_err(|e| MeterError::config(format!("{}: {e}", path.display())))?;
            for table in tables {
                info!("Using user provided definition of {}", table.model());
                self.insert(table);
                count += 1;
            }
        }
        return Ok(count);
    }

    pub fn get(&self, model: &str) -> Result<RegisterTable, MeterError> {
        match self.tables.get(&model.to_lowercase()) {
            Some(table) => Ok(table.clone()),
            None => Err(MeterError::config(format!(
                "Unknown meter model {model}, known models are: {}",
                self.models().join(", ")
            ))),
        }
    }

    pub fn contains(&self, model: &str) -> bool {
        self.tables.contains_key(&model.to_lowercase())
    }

    pub fn models(&self) -> Vec<&str> {
        self.tables.values().map(|t| t.model()).collect()
    }

    pub fn tables(&self) -> impl Iterator<Item = &RegisterTable> {
        self.tables.values()
    }
}

/// Parse one definition file, returns the full table followed by its variants
pub fn parse_definition(contents: &str) -> Result<Vec<RegisterTable>, MeterError> {
    let file: RegisterFile = serde_yml::from_str(contents)
        .map_err(|e| MeterError::config(format!("Failed to parse register definition: {e}")))?;

    if file.registers.is_empty() {
        return Err(MeterError::config(format!("{}: definition has no registers", file.model)));
    }

    let registers = file.registers.into_iter()
        .map(|mut r| {
            r.byte_order.get_or_insert(file.byte_order);
            r
        })
        .collect();

    let nulls = file.nulls.into_iter()
        .map(|(bits, values)| (bits, values.into_iter().map(i128::from).collect()))
        .collect();

    let table = RegisterTable::new(&file.model, registers)?
        .with_manufacturer(&file.manufacturer)
        .with_nulls(nulls)
        .with_defaults(file.transport, file.defaults)
        .with_register_offset(file.register_offset)?
        .with_batching(file.batching)?
        .with_dynamic_scales(file.dynamic_scales)?;

    let mut tables = Vec::with_capacity(file.variants.len() + 1);
    for (variant, names) in file.variants.iter() {
        let model = format!("{}-{}", file.model, variant);
        let sub = table.restrict(&model, names)
            .map_err(|e| MeterError::config(format!("Variant {model}: {e}")))?;
        tables.push(sub);
    }
    tables.insert(0, table);
    return Ok(tables);
}

/// Register table of a builtin model
pub fn get_register_table(model: &str) -> Result<RegisterTable, MeterError> {
    RegisterCatalog::builtin().get(model)
}
