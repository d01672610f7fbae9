use log::{debug, info};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::config::MeterConfig;
use crate::error::MeterError;
use crate::registers::{RegisterCatalog, RegisterSpec, RegisterTable};
use crate::transport::{self, Transport};

pub mod plan;
#[cfg(feature = "async-tcp")]
pub mod async_client;

pub use plan::ReadPlan;
#[cfg(feature = "async-tcp")]
pub use async_client::AsyncMeterClient;

/// Values of one read, in the order they were asked for.
///
/// `None` marks a register the meter reports as not available.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings {
    values: Vec<(String, Option<f64>)>,
}

impl Readings {
    pub fn new() -> Self {
        Readings { values: Vec::new() }
    }

    pub fn push(&mut self, name: &str, value: Option<f64>) {
        self.values.push((name.to_string(), value));
    }

    /// `None` if the field was not read, `Some(None)` if it has no value
    pub fn get(&self, name: &str) -> Option<Option<f64>> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name).flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.values.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Readings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.values.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Names of a read request without repetitions, rejected if one is unknown
pub(crate) fn resolve_fields<'a, S: AsRef<str>>(
    table: &'a RegisterTable,
    names: &[S],
) -> Result<Vec<&'a RegisterSpec>, MeterError> {
    let mut specs: Vec<&RegisterSpec> = Vec::with_capacity(names.len());
    for name in names {
        let spec = table.get(name.as_ref())?;
        if !specs.iter().any(|s| s.name == spec.name) {
            specs.push(spec);
        }
    }
    Ok(specs)
}

pub(crate) fn collect(specs: &[&RegisterSpec], values: Vec<Option<f64>>) -> Readings {
    let mut readings = Readings::new();
    for (spec, value) in specs.iter().zip(values) {
        readings.push(&spec.name, value);
    }
    readings
}

/// New table with the scales selected by the given scale codes, one code per dynamic scale group
pub(crate) fn rescale_table(table: &RegisterTable, codes: &[Option<f64>]) -> Result<RegisterTable, MeterError> {
    let mut scaled = table.clone();
    for (group, code) in table.dynamic_scales().iter().zip(codes) {
        let code = match code {
            Some(c) => *c as i64,
            None => {
                return Err(MeterError::config(format!(
                    "{}: scale register {} has no value",
                    table.model(), group.source
                )))
            }
        };
        let scale = match group.scale_for(code) {
            Some(s) => s,
            None => {
                return Err(MeterError::config(format!(
                    "{}: scale register {} reports unknown code {code}",
                    table.model(), group.source
                )))
            }
        };
        debug!("{}: scale code {code} of {} selects scale {scale}", table.model(), group.source);
        scaled = scaled.rescaled(&group.targets, scale)?;
    }
    Ok(scaled)
}

/// A meter: one register table read through one transport from one slave id.
///
/// Which vendor the meter is from only shows in the table, every model is read
/// the same way.
pub struct MeterClient<T: Transport> {
    table: RegisterTable,
    transport: T,
    slave_id: u8,
}

impl<T: Transport> MeterClient<T> {
    pub fn new(table: RegisterTable, transport: T, slave_id: u8) -> Self {
        return MeterClient { table, transport, slave_id };
    }

    pub fn table(&self) -> &RegisterTable {
        &self.table
    }

    pub fn model(&self) -> &str {
        self.table.model()
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn connect(&mut self) -> Result<(), MeterError> {
        self.transport.connect()?;
        Ok(())
    }

    /// Read every register of the table
    pub fn read_all(&mut self) -> Result<Readings, MeterError> {
        let specs: Vec<&RegisterSpec> = self.table.registers().iter().collect();
        let plan = ReadPlan::new(&self.table, specs);
        let values = Self::run(&mut self.transport, self.slave_id, &plan)?;
        Ok(collect(plan.specs(), values))
    }

    pub fn read_field(&mut self, name: &str) -> Result<Option<f64>, MeterError> {
        let readings = self.read_fields(&[name])?;
        Ok(readings.value(name))
    }

    /// Read the named registers, the result keeps the order of `names`
    pub fn read_fields<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Readings, MeterError> {
        let specs = resolve_fields(&self.table, names)?;
        if specs.is_empty() {
            return Ok(Readings::new());
        }
        let plan = ReadPlan::new(&self.table, specs);
        let values = Self::run(&mut self.transport, self.slave_id, &plan)?;
        Ok(collect(plan.specs(), values))
    }

    /// Read the scale code registers and rescale the registers depending on them
    pub fn apply_dynamic_scales(&mut self) -> Result<(), MeterError> {
        if self.table.dynamic_scales().is_empty() {
            return Ok(());
        }
        let sources: Vec<String> = self.table.dynamic_scales().iter().map(|s| s.source.clone()).collect();
        let readings = self.read_fields(&sources)?;
        let codes: Vec<Option<f64>> = sources.iter().map(|s| readings.value(s)).collect();

        self.table = rescale_table(&self.table, &codes)?;
        info!("{}: applied {} dynamic scales", self.table.model(), codes.len());
        Ok(())
    }

    fn run(transport: &mut T, slave_id: u8, plan: &ReadPlan) -> Result<Vec<Option<f64>>, MeterError> {
        let mut responses = Vec::with_capacity(plan.batches().len());
        for batch in plan.batches() {
            let words = transport.read_registers(slave_id, batch.kind, batch.address, batch.count)?;
            responses.push(words);
        }
        plan.decode(&responses)
    }
}

impl MeterClient<Box<dyn Transport>> {
    /// Client for a configured meter using the builtin register tables
    pub fn open(config: &MeterConfig) -> Result<Self, MeterError> {
        Self::open_with_catalog(config, RegisterCatalog::builtin())
    }

    pub fn open_with_catalog(config: &MeterConfig, catalog: &RegisterCatalog) -> Result<Self, MeterError> {
        let table = catalog.get(&config.model)?;

        /* check the field list before anything is opened */
        for name in config.fields.iter() {
            table.get(name)?;
        }

        let endpoint = config.endpoint(table.defaults());
        let slave_id = config.slave_id(table.defaults());
        info!("Meter {}: {} at {endpoint}, slave {slave_id}", config.name, table.model());

        let transport = transport::open(&endpoint)?;
        let mut client = MeterClient::new(table, transport, slave_id);

        if config.auto_scale {
            client.apply_dynamic_scales()?;
        }
        if !config.fields.is_empty() {
            let model = client.table.model().to_string();
            client.table = client.table.restrict(&model, &config.fields)?;
        }
        return Ok(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommunicationError;
    use crate::registers::{get_register_table, DataType, RegisterKind};
    use crate::transport::MemoryTransport;

    fn sample_table() -> RegisterTable {
        RegisterTable::new("sample", vec![
            RegisterSpec::new("voltage", 100, DataType::Uint16).with_scale(0.1),
            RegisterSpec::new("current", 101, DataType::Int32).with_scale(0.01),
            RegisterSpec::new("energy", 110, DataType::Uint64).with_scale(0.01),
            RegisterSpec::new("frequency", 5, DataType::Uint16).with_kind(RegisterKind::Input).with_scale(0.01),
        ]).unwrap()
    }

    fn sample_client() -> MeterClient<MemoryTransport> {
        let mut t = MemoryTransport::new();
        t.set(100, &[2300, 0xFFFF, 0xFE0C]);
        t.set(110, &[0, 0, 1, 0x86A0]);
        t.set_input(5, &[5000]);
        MeterClient::new(sample_table(), t, 1)
    }

    #[test]
    fn test_read_field() {
        let mut client = sample_client();
        assert_eq!(client.read_field("voltage").unwrap(), Some(230.0));
        assert_eq!(client.read_field("current").unwrap(), Some(-5.0));
        assert_eq!(client.read_field("energy").unwrap(), Some(1000.0));
        assert_eq!(client.read_field("frequency").unwrap(), Some(50.0));
    }

    #[test]
    fn test_read_fields_keeps_order() {
        let mut client = sample_client();
        let readings = client.read_fields(&["energy", "voltage", "frequency"]).unwrap();
        assert_eq!(readings.names().collect::<Vec<_>>(), vec!["energy", "voltage", "frequency"]);
        assert_eq!(readings.value("voltage"), Some(230.0));
        assert_eq!(readings.get("current"), None);
    }

    #[test]
    fn test_read_fields_equals_single_reads() {
        let mut client = sample_client();
        let names = ["current", "voltage", "energy", "frequency"];
        let readings = client.read_fields(&names).unwrap();
        for name in names.iter() {
            assert_eq!(readings.get(name), Some(client.read_field(name).unwrap()));
        }
    }

    #[test]
    fn test_unknown_field_sends_nothing() {
        let mut client = sample_client();
        let result = client.read_fields(&["voltage", "power"]);
        assert!(matches!(result, Err(MeterError::UnknownField(n)) if n == "power"));
        assert!(matches!(client.read_field("power"), Err(MeterError::UnknownField(_))));
        assert!(client.transport().requests().is_empty());
    }

    #[test]
    fn test_empty_and_duplicate_requests() {
        let mut client = sample_client();
        let empty: [&str; 0] = [];
        assert!(client.read_fields(&empty).unwrap().is_empty());
        assert!(client.transport().requests().is_empty());

        let readings = client.read_fields(&["voltage", "current", "voltage"]).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings.names().collect::<Vec<_>>(), vec!["voltage", "current"]);
    }

    #[test]
    fn test_read_all_batches() {
        let mut client = sample_client();
        let readings = client.read_all().unwrap();
        assert_eq!(readings.len(), 4);
        assert_eq!(readings.names().collect::<Vec<_>>(), vec!["voltage", "current", "energy", "frequency"]);

        /* 100..103 and 110..114 are too far apart for the default max_gap of 0 */
        let requests = client.transport().requests();
        assert_eq!(requests.len(), 3);
        assert_eq!((requests[0].address, requests[0].count), (100, 3));
        assert_eq!((requests[1].address, requests[1].count), (110, 4));
        assert_eq!(requests[2].kind, RegisterKind::Input);
    }

    #[test]
    fn test_fail_fast() {
        let mut client = sample_client();
        client.transport_mut().fail_after(1);
        let result = client.read_all();
        assert!(matches!(result, Err(MeterError::Communication(CommunicationError::Io(_)))));
        assert_eq!(client.transport().requests().len(), 1);
    }

    #[test]
    fn test_device_exception_is_communication_error() {
        let mut client = MeterClient::new(sample_table(), MemoryTransport::new(), 1);
        let result = client.read_field("voltage");
        assert!(matches!(result, Err(MeterError::Communication(CommunicationError::Exception(2)))));
    }

    #[test]
    fn test_readings_serialize_in_order() {
        let mut readings = Readings::new();
        readings.push("voltage", Some(230.0));
        readings.push("current", None);
        readings.push("energy", Some(12.5));
        let json = serde_json::to_string(&readings).unwrap();
        assert_eq!(json, r#"{"voltage":230.0,"current":null,"energy":12.5}"#);
    }

    #[test]
    fn test_sma_meter() {
        let table = get_register_table("SMA").unwrap();
        let mut t = MemoryTransport::new();
        let client_table = table.restrict("SMA", &["voltage_l1_n", "power_factor_total"]).unwrap();

        let voltage = table.get("voltage_l1_n").unwrap();
        let pf = table.get("power_factor_total").unwrap();
        t.set(table.wire_address(voltage), &[23000]);
        t.set(table.wire_address(pf), &[0]);

        let mut client = MeterClient::new(client_table, t, 126);
        let readings = client.read_all().unwrap();
        assert_eq!(readings.value("power_factor_total"), Some(1.0));
        assert!(readings.value("voltage_l1_n").is_some());
        assert!(client.transport().requests().iter().all(|r| r.slave_id == 126));
        assert_eq!(client.transport().requests()[0].address, voltage.address - 1);
    }

    #[test]
    fn test_not_available_values() {
        let table = get_register_table("SMA").unwrap().restrict("SMA", &["voltage_l1_n"]).unwrap();
        let mut t = MemoryTransport::new();
        t.set(table.wire_address(table.get("voltage_l1_n").unwrap()), &[0xFFFF]);
        let mut client = MeterClient::new(table, t, 126);
        assert_eq!(client.read_field("voltage_l1_n").unwrap(), None);
        assert_eq!(client.read_all().unwrap().get("voltage_l1_n"), Some(None));
    }

    fn set_code(t: &mut MemoryTransport, table: &RegisterTable, name: &str, code: u16) {
        let spec = table.get(name).unwrap();
        let mut words = vec![0; usize::from(spec.length)];
        if let Some(last) = words.last_mut() {
            *last = code;
        }
        t.set(table.wire_address(spec), &words);
    }

    #[test]
    fn test_multicube_dynamic_scales() {
        let table = get_register_table("Multicube").unwrap();
        let mut t = MemoryTransport::new();
        for spec in table.registers() {
            t.set(table.wire_address(spec), &vec![0; usize::from(spec.length)]);
        }
        /* amps code 1: two decimals, energy code 6: no decimals, the rest 3: no decimals */
        for group in table.dynamic_scales() {
            let code = match group.source.as_str() {
                "amps_scale" => 1,
                "energy_scale" => 6,
                _ => 3,
            };
            set_code(&mut t, &table, &group.source, code);
        }
        let current = table.get("current_l1").unwrap();
        t.set(table.wire_address(current), &[1234]);

        let mut client = MeterClient::new(table, t, 1);
        client.apply_dynamic_scales().unwrap();
        assert_eq!(client.table().get("current_l1").unwrap().scale, 0.01);
        assert_eq!(client.table().get("active_net").unwrap().scale, 1.0);
        assert_eq!(client.read_field("current_l1").unwrap(), Some(12.34));
    }

    #[test]
    fn test_unknown_scale_code() {
        let table = get_register_table("Multicube").unwrap();
        let mut t = MemoryTransport::new();
        for group in table.dynamic_scales() {
            set_code(&mut t, &table, &group.source, 42);
        }
        let mut client = MeterClient::new(table, t, 1);
        assert!(matches!(client.apply_dynamic_scales(), Err(MeterError::Configuration(_))));
    }

    #[test]
    fn test_open_unknown_model() {
        let config: MeterConfig = serde_yml::from_str(
            "{ name: x, model: Ferraris, connection: { type: tcp, host: 127.0.0.1 } }"
        ).unwrap();
        assert!(matches!(MeterClient::open(&config), Err(MeterError::Configuration(_))));
    }

    #[test]
    fn test_open_unknown_field() {
        let config: MeterConfig = serde_yml::from_str(
            "{ name: x, model: SMA, fields: [nothing], connection: { type: tcp, host: 127.0.0.1 } }"
        ).unwrap();
        assert!(matches!(MeterClient::open(&config), Err(MeterError::UnknownField(_))));
    }

    #[test]
    fn test_open_restricts_fields() {
        let config: MeterConfig = serde_yml::from_str(
            "{ name: x, model: SMA, fields: [voltage_l1_n], connection: { type: tcp, host: 127.0.0.1, port: 1 } }"
        ).unwrap();
        let client = MeterClient::open(&config).unwrap();
        assert_eq!(client.table().len(), 1);
        assert_eq!(client.slave_id(), 126);
    }
}
