use log::debug;

use crate::error::{DecodeError, MeterError};
use crate::registers::{RegisterKind, RegisterSpec, RegisterTable};

/// One Modbus request covering one or more registers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub kind: RegisterKind,
    /// Wire address of the first register
    pub address: u16,
    pub count: u16,
    /* positions in the planned register list */
    members: Vec<usize>,
}

impl Batch {
    fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.count)
    }
}

/// Requests needed to fetch a list of registers of one table.
///
/// Registers are sorted by kind and wire address and grouped so that one batch
/// never spans more than `max_registers` words and never skips more than
/// `max_gap` unwanted words between two wanted ones.
#[derive(Debug)]
pub struct ReadPlan<'a> {
    table: &'a RegisterTable,
    specs: Vec<&'a RegisterSpec>,
    batches: Vec<Batch>,
}

impl<'a> ReadPlan<'a> {
    pub fn new(table: &'a RegisterTable, specs: Vec<&'a RegisterSpec>) -> Self {
        let batching = table.batching();

        let mut order: Vec<usize> = (0..specs.len()).collect();
        order.sort_by_key(|i| (specs[*i].kind, table.wire_address(specs[*i])));

        let mut batches: Vec<Batch> = Vec::new();
        for i in order {
            let spec = specs[i];
            let address = table.wire_address(spec);
            let end = u32::from(address) + u32::from(spec.length);

            if let Some(batch) = batches.last_mut() {
                let fits_gap = u32::from(address) <= batch.end() + u32::from(batching.max_gap);
                let new_end = end.max(batch.end());
                let fits_size = new_end - u32::from(batch.address) <= u32::from(batching.max_registers);

                if batch.kind == spec.kind && fits_gap && fits_size {
                    batch.count = (new_end - u32::from(batch.address)) as u16;
                    batch.members.push(i);
                    continue;
                }
            }

            batches.push(Batch { kind: spec.kind, address, count: spec.length, members: vec![i] });
        }

        debug!("{}: {} registers in {} requests", table.model(), specs.len(), batches.len());
        return ReadPlan { table, specs, batches };
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn specs(&self) -> &[&'a RegisterSpec] {
        &self.specs
    }

    /// Decode the answers, one per batch, into values in the planned order
    pub fn decode(&self, responses: &[Vec<u16>]) -> Result<Vec<Option<f64>>, MeterError> {
        if responses.len() != self.batches.len() {
            return Err(MeterError::config(format!(
                "{} answers for {} requests",
                responses.len(),
                self.batches.len()
            )));
        }

        let mut values = vec![None; self.specs.len()];
        for (batch, words) in self.batches.iter().zip(responses) {
            if words.len() != usize::from(batch.count) {
                let first = self.specs[batch.members[0]];
                return Err(MeterError::Decode {
                    name: first.name.clone(),
                    source: DecodeError::LengthMismatch { expected: usize::from(batch.count), actual: words.len() },
                });
            }

            for i in batch.members.iter() {
                let spec = self.specs[*i];
                let start = usize::from(self.table.wire_address(spec) - batch.address);
                let end = start + usize::from(spec.length);
                values[*i] = self.table.decode(spec, &words[start..end])?;
            }
        }
        Ok(values)
    }
}
