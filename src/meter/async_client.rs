use log::info;

use crate::config::{ConnectionConfig, MeterConfig};
use crate::error::MeterError;
use crate::registers::{RegisterCatalog, RegisterSpec, RegisterTable};
use crate::transport::{AsyncTcpTransport, Endpoint};
use super::{collect, rescale_table, resolve_fields, ReadPlan, Readings};

/// Meter client for Modbus TCP meters on tokio, reads like MeterClient
pub struct AsyncMeterClient {
    table: RegisterTable,
    transport: AsyncTcpTransport,
    slave_id: u8,
}

impl AsyncMeterClient {
    pub fn new(table: RegisterTable, transport: AsyncTcpTransport, slave_id: u8) -> Self {
        return AsyncMeterClient { table, transport, slave_id };
    }

    /// Client for a configured TCP meter using the builtin register tables
    pub async fn open(config: &MeterConfig) -> Result<Self, MeterError> {
        Self::open_with_catalog(config, RegisterCatalog::builtin()).await
    }

    /// Serial meters are not supported here
    pub async fn open_with_catalog(config: &MeterConfig, catalog: &RegisterCatalog) -> Result<Self, MeterError> {
        let table = catalog.get(&config.model)?;
        for name in config.fields.iter() {
            table.get(name)?;
        }

        if let ConnectionConfig::Rtu { port, .. } = &config.connection {
            return Err(MeterError::config(format!(
                "Meter {}: serial port {port} cannot be used asynchronously",
                config.name
            )));
        }
        let (host, port, timeout) = match config.endpoint(table.defaults()) {
            Endpoint::Tcp { host, port, timeout } => (host, port, timeout),
            Endpoint::Rtu { port, .. } => {
                return Err(MeterError::config(format!("Unexpected serial endpoint {port}")));
            }
        };
        let slave_id = config.slave_id(table.defaults());
        info!("Meter {}: {} at tcp://{host}:{port}, slave {slave_id}", config.name, table.model());

        let mut client = AsyncMeterClient::new(table, AsyncTcpTransport::new(&host, port, timeout), slave_id);
        if config.auto_scale {
            client.apply_dynamic_scales().await?;
        }
        if !config.fields.is_empty() {
            let model = client.table.model().to_string();
            client.table = client.table.restrict(&model, &config.fields)?;
        }
        return Ok(client);
    }

    pub fn table(&self) -> &RegisterTable {
        &self.table
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub async fn connect(&mut self) -> Result<(), MeterError> {
        self.transport.connect().await?;
        Ok(())
    }

    async fn run(
        transport: &mut AsyncTcpTransport,
        slave_id: u8,
        plan: &ReadPlan<'_>,
    ) -> Result<Vec<Option<f64>>, MeterError> {
        let mut responses = Vec::with_capacity(plan.batches().len());
        for batch in plan.batches() {
            let words = transport.read_registers(slave_id, batch.kind, batch.address, batch.count).await?;
            responses.push(words);
        }
        plan.decode(&responses)
    }

    pub async fn read_all(&mut self) -> Result<Readings, MeterError> {
        let specs: Vec<&RegisterSpec> = self.table.registers().iter().collect();
        let plan = ReadPlan::new(&self.table, specs);
        let values = Self::run(&mut self.transport, self.slave_id, &plan).await?;
        Ok(collect(plan.specs(), values))
    }

    pub async fn read_field(&mut self, name: &str) -> Result<Option<f64>, MeterError> {
        let readings = self.read_fields(&[name]).await?;
        Ok(readings.value(name))
    }

    pub async fn read_fields<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Readings, MeterError> {
        let specs = resolve_fields(&self.table, names)?;
        if specs.is_empty() {
            return Ok(Readings::new());
        }
        let plan = ReadPlan::new(&self.table, specs);
        let values = Self::run(&mut self.transport, self.slave_id, &plan).await?;
        Ok(collect(plan.specs(), values))
    }

    pub async fn apply_dynamic_scales(&mut self) -> Result<(), MeterError> {
        if self.table.dynamic_scales().is_empty() {
            return Ok(());
        }
        let sources: Vec<String> = self.table.dynamic_scales().iter().map(|s| s.source.clone()).collect();
        let readings = self.read_fields(&sources).await?;
        let codes: Vec<Option<f64>> = sources.iter().map(|s| readings.value(s)).collect();

        self.table = rescale_table(&self.table, &codes)?;
        info!("{}: applied {} dynamic scales", self.table.model(), codes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use crate::error::CommunicationError;
    use crate::transport::frame;

    /// Fake Modbus TCP meter serving a fixed register image
    async fn spawn_meter(image: HashMap<u16, u16>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            while stream.read_exact(&mut request).await.is_ok() {
                let address = u16::from_be_bytes([request[8], request[9]]);
                let count = u16::from_be_bytes([request[10], request[11]]);
                let values: Vec<u16> = (address..address + count)
                    .map(|a| image.get(&a).copied().unwrap_or(0))
                    .collect();
                if stream.write_all(&frame::tcp_answer(&request, &values)).await.is_err() {
                    break;
                }
            }
        });
        port
    }

    fn sma_config(port: u16, fields: &str) -> MeterConfig {
        serde_yml::from_str(&format!(
            "{{ name: inverter, model: SMA, fields: {fields}, connection: {{ type: tcp, host: 127.0.0.1, port: {port} }} }}"
        )).unwrap()
    }

    #[tokio::test]
    async fn test_async_sma_read() {
        /* wire addresses are one below the documented register numbers */
        let image = HashMap::from([(40195, 2301), (40207, 0), (40201, 5000)]);
        let port = spawn_meter(image).await;

        let config = sma_config(port, "[power_factor_total, voltage_l1_n, frequency]");
        let mut client = AsyncMeterClient::open(&config).await.unwrap();
        assert_eq!(client.slave_id(), 126);

        let readings = client.read_all().await.unwrap();
        assert_eq!(readings.value("voltage_l1_n"), Some(230.1));
        assert_eq!(readings.value("power_factor_total"), Some(1.0));
        assert_eq!(readings.value("frequency"), Some(50.0));

        let readings = client.read_fields(&["frequency", "voltage_l1_n"]).await.unwrap();
        assert_eq!(readings.names().collect::<Vec<_>>(), vec!["frequency", "voltage_l1_n"]);
        assert_eq!(client.read_field("frequency").await.unwrap(), Some(50.0));
    }

    #[tokio::test]
    async fn test_async_unknown_field() {
        let port = spawn_meter(HashMap::new()).await;
        let config = sma_config(port, "[]");
        let mut client = AsyncMeterClient::open(&config).await.unwrap();
        let result = client.read_field("torque").await;
        assert!(matches!(result, Err(MeterError::UnknownField(_))));
    }

    #[tokio::test]
    async fn test_async_connection_refused() {
        /* bind and drop to get a port nobody listens on */
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = sma_config(port, "[]");
        let mut client = AsyncMeterClient::open(&config).await.unwrap();
        let result = client.read_field("frequency").await;
        assert!(matches!(result, Err(MeterError::Communication(CommunicationError::Io(_)))));
    }

    #[tokio::test]
    async fn test_async_rejects_serial() {
        let config: MeterConfig = serde_yml::from_str(
            "{ name: x, model: ABB, connection: { type: rtu, port: /dev/ttyUSB0 } }"
        ).unwrap();
        let result = AsyncMeterClient::open(&config).await;
        assert!(matches!(result, Err(MeterError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_async_multicube_scales() {
        let table = RegisterCatalog::builtin().get("Multicube").unwrap();
        let wire = |name: &str| table.wire_address(table.get(name).unwrap());
        /* amps code 1: two decimals, volts code 2: one decimal, the rest 3: no decimals */
        let image = HashMap::from([
            (wire("amps_scale"), 1),
            (wire("phase_volts_scale"), 2),
            (wire("line_volts_scale"), 3),
            (wire("power_scale"), 3),
            (wire("energy_scale") + 1, 6),
            (wire("current_l1"), 1234),
            (wire("voltage_l1_n"), 2301),
            (wire("power_factor_total"), 0),
        ]);
        let port = spawn_meter(image).await;

        let config: MeterConfig = serde_yml::from_str(&format!(
            "{{ name: cube, model: Multicube, auto_scale: false, connection: {{ type: tcp, host: 127.0.0.1, port: {port} }} }}"
        )).unwrap();
        let catalog = RegisterCatalog::builtin().clone();
        let mut client = AsyncMeterClient::open_with_catalog(&config, &catalog).await.unwrap();
        assert_eq!(client.table().get("current_l1").unwrap().scale, 1.0);

        client.apply_dynamic_scales().await.unwrap();
        assert_eq!(client.table().get("current_l1").unwrap().scale, 0.01);
        assert_eq!(client.table().get("voltage_l1_n").unwrap().scale, 0.1);

        let readings = client.read_fields(&["current_l1", "voltage_l1_n", "power_factor_total"]).await.unwrap();
        assert_eq!(readings.value("current_l1"), Some(12.34));
        assert_eq!(readings.value("voltage_l1_n"), Some(230.1));
        assert_eq!(readings.value("power_factor_total"), Some(1.0));
    }

    #[tokio::test]
    async fn test_async_open_applies_scales() {
        let table = RegisterCatalog::builtin().get("Multicube").unwrap();
        let wire = |name: &str| table.wire_address(table.get(name).unwrap());
        let mut image = HashMap::new();
        for group in table.dynamic_scales() {
            let spec = table.get(&group.source).unwrap();
            image.insert(wire(&group.source) + spec.length - 1, if group.source == "energy_scale" { 6 } else { 1 });
        }
        image.insert(wire("current_l2"), 505);
        let port = spawn_meter(image).await;

        let config: MeterConfig = serde_yml::from_str(&format!(
            "{{ name: cube, model: Multicube, fields: [current_l2], connection: {{ type: tcp, host: 127.0.0.1, port: {port} }} }}"
        )).unwrap();
        let mut client = AsyncMeterClient::open(&config).await.unwrap();
        let readings = client.read_all().await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings.value("current_l2"), Some(5.05));
    }
}
