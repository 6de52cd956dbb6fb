//! The slave's register image: four tables behind two family locks.

use crate::server::{ModbusService, ServiceError};
use modlink_core::codec::apply_mask;
use modlink_core::encoding::Writer;
use modlink_core::pdu::{
    DecodedRequest, ExceptionCode, MaskWriteRequest, ReadRequest, Response, Table, WireWords,
    MAX_READ_BITS, MAX_READ_REGISTERS,
};
use modlink_core::EncodeError;
use std::ops::Range;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_TABLE_SIZE: usize = 0x1_0000;
const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
    /// Requests touching a disabled table are answered with exception 1.
    pub enabled: bool,
    pub size: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: DEFAULT_TABLE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageConfig {
    pub coils: TableConfig,
    pub discrete_inputs: TableConfig,
    pub holding_registers: TableConfig,
    pub input_registers: TableConfig,
}

impl ImageConfig {
    /// Every table enabled with `size` entries.
    pub fn uniform(size: usize) -> Self {
        let table = TableConfig {
            enabled: true,
            size,
        };
        Self {
            coils: table,
            discrete_inputs: table,
            holding_registers: table,
            input_registers: table,
        }
    }

    pub fn table(&self, table: Table) -> TableConfig {
        match table {
            Table::Coils => self.coils,
            Table::DiscreteInputs => self.discrete_inputs,
            Table::HoldingRegisters => self.holding_registers,
            Table::InputRegisters => self.input_registers,
        }
    }

    pub fn table_mut(&mut self, table: Table) -> &mut TableConfig {
        match table {
            Table::Coils => &mut self.coils,
            Table::DiscreteInputs => &mut self.discrete_inputs,
            Table::HoldingRegisters => &mut self.holding_registers,
            Table::InputRegisters => &mut self.input_registers,
        }
    }
}

/// A span of a table changed by a master's write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageChange {
    pub table: Table,
    pub address: u16,
    pub count: u16,
}

#[derive(Debug)]
struct Family<T> {
    primary: Vec<T>,
    input: Vec<T>,
}

impl<T> Family<T> {
    fn get(&self, table: Table) -> &[T] {
        match table {
            Table::Coils | Table::HoldingRegisters => &self.primary,
            Table::DiscreteInputs | Table::InputRegisters => &self.input,
        }
    }

    fn get_mut(&mut self, table: Table) -> &mut [T] {
        match table {
            Table::Coils | Table::HoldingRegisters => &mut self.primary,
            Table::DiscreteInputs | Table::InputRegisters => &mut self.input,
        }
    }
}

/// Coils and discrete inputs share one lock, holding and input registers
/// share the other, so bit and word traffic never contend. No reference to
/// a table outlives the accessor that took its lock.
#[derive(Debug)]
pub struct RegisterImage {
    config: ImageConfig,
    bits: RwLock<Family<bool>>,
    words: RwLock<Family<u16>>,
    changes: broadcast::Sender<ImageChange>,
}

impl Default for RegisterImage {
    fn default() -> Self {
        Self::new(ImageConfig::default())
    }
}

impl RegisterImage {
    pub fn new(config: ImageConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            bits: RwLock::new(Family {
                primary: vec![false; config.coils.size],
                input: vec![false; config.discrete_inputs.size],
            }),
            words: RwLock::new(Family {
                primary: vec![0; config.holding_registers.size],
                input: vec![0; config.input_registers.size],
            }),
            config,
            changes,
        }
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Receive an [`ImageChange`] after every successful write request.
    pub fn subscribe(&self) -> broadcast::Receiver<ImageChange> {
        self.changes.subscribe()
    }

    fn bits(&self) -> RwLockReadGuard<'_, Family<bool>> {
        self.bits.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn bits_mut(&self) -> RwLockWriteGuard<'_, Family<bool>> {
        self.bits.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn words(&self) -> RwLockReadGuard<'_, Family<u16>> {
        self.words.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn words_mut(&self) -> RwLockWriteGuard<'_, Family<u16>> {
        self.words.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_enabled(&self, table: Table) -> Result<(), ServiceError> {
        if self.config.table(table).enabled {
            Ok(())
        } else {
            Err(ServiceError::Exception(ExceptionCode::IllegalFunction))
        }
    }

    pub fn read_bits(&self, table: Table, address: u16, out: &mut [bool]) -> Result<(), ServiceError> {
        let bits = self.bits();
        let source = bits.get(table);
        out.copy_from_slice(&source[span(address, out.len(), source.len())?]);
        Ok(())
    }

    pub fn write_bits(&self, table: Table, address: u16, values: &[bool]) -> Result<(), ServiceError> {
        let mut bits = self.bits_mut();
        let target = bits.get_mut(table);
        let range = span(address, values.len(), target.len())?;
        target[range].copy_from_slice(values);
        Ok(())
    }

    pub fn read_words(&self, table: Table, address: u16, out: &mut [u16]) -> Result<(), ServiceError> {
        let words = self.words();
        let source = words.get(table);
        out.copy_from_slice(&source[span(address, out.len(), source.len())?]);
        Ok(())
    }

    pub fn write_words(&self, table: Table, address: u16, values: &[u16]) -> Result<(), ServiceError> {
        let mut words = self.words_mut();
        let target = words.get_mut(table);
        let range = span(address, values.len(), target.len())?;
        target[range].copy_from_slice(values);
        Ok(())
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.bits().primary.get(usize::from(address)).copied()
    }

    pub fn discrete_input(&self, address: u16) -> Option<bool> {
        self.bits().input.get(usize::from(address)).copied()
    }

    pub fn holding_register(&self, address: u16) -> Option<u16> {
        self.words().primary.get(usize::from(address)).copied()
    }

    pub fn input_register(&self, address: u16) -> Option<u16> {
        self.words().input.get(usize::from(address)).copied()
    }

    pub fn set_coil(&self, address: u16, value: bool) -> Result<(), ServiceError> {
        self.write_bits(Table::Coils, address, &[value])
    }

    pub fn set_discrete_input(&self, address: u16, value: bool) -> Result<(), ServiceError> {
        self.write_bits(Table::DiscreteInputs, address, &[value])
    }

    pub fn set_holding_register(&self, address: u16, value: u16) -> Result<(), ServiceError> {
        self.write_words(Table::HoldingRegisters, address, &[value])
    }

    pub fn set_input_register(&self, address: u16, value: u16) -> Result<(), ServiceError> {
        self.write_words(Table::InputRegisters, address, &[value])
    }

    fn respond_read(&self, req: ReadRequest, w: &mut Writer<'_>) -> Result<(), ServiceError> {
        self.ensure_enabled(req.table)?;
        let quantity = usize::from(req.quantity);
        if req.table.is_bit() {
            let mut packed = [0u8; MAX_READ_BITS as usize / 8];
            {
                let bits = self.bits();
                let source = bits.get(req.table);
                for (i, bit) in source[span(req.address, quantity, source.len())?]
                    .iter()
                    .enumerate()
                {
                    if *bit {
                        packed[i / 8] |= 1 << (i % 8);
                    }
                }
            }
            Response::ReadBits {
                table: req.table,
                packed: &packed[..quantity.div_ceil(8)],
            }
            .encode(w)
            .map_err(map_encode)
        } else {
            let mut bytes = [0u8; MAX_READ_REGISTERS as usize * 2];
            {
                let words = self.words();
                let source = words.get(req.table);
                store_wire_words(&source[span(req.address, quantity, source.len())?], &mut bytes);
            }
            Response::ReadRegisters {
                table: req.table,
                words: WireWords::new(&bytes[..quantity * 2]),
            }
            .encode(w)
            .map_err(map_encode)
        }
    }

    fn mask_write(&self, req: MaskWriteRequest) -> Result<(), ServiceError> {
        let mut words = self.words_mut();
        let registers = words.get_mut(Table::HoldingRegisters);
        let slot = registers
            .get_mut(usize::from(req.address))
            .ok_or(ServiceError::Exception(ExceptionCode::IllegalDataAddress))?;
        *slot = apply_mask(*slot, req.and_mask, req.or_mask);
        Ok(())
    }

    fn notify(&self, table: Table, address: u16, count: usize) {
        let count = u16::try_from(count).unwrap_or(u16::MAX);
        debug!(%table, address, count, "register image changed");
        // No subscribers is not an error.
        let _ = self.changes.send(ImageChange {
            table,
            address,
            count,
        });
    }
}

impl ModbusService for RegisterImage {
    fn handle(
        &self,
        _unit_id: u8,
        request: DecodedRequest<'_>,
        response_pdu: &mut [u8],
    ) -> Result<usize, ServiceError> {
        let mut w = Writer::new(response_pdu);

        match request {
            DecodedRequest::Read(req) => self.respond_read(req, &mut w)?,
            DecodedRequest::WriteCoil(req) => {
                self.ensure_enabled(Table::Coils)?;
                self.write_bits(Table::Coils, req.address, &[req.value])?;
                Response::WriteCoil(req).encode(&mut w).map_err(map_encode)?;
                self.notify(Table::Coils, req.address, 1);
            }
            DecodedRequest::WriteRegister(req) => {
                self.ensure_enabled(Table::HoldingRegisters)?;
                self.write_words(Table::HoldingRegisters, req.address, &[req.value])?;
                Response::WriteRegister(req).encode(&mut w).map_err(map_encode)?;
                self.notify(Table::HoldingRegisters, req.address, 1);
            }
            DecodedRequest::WriteCoils { address, bits } => {
                self.ensure_enabled(Table::Coils)?;
                {
                    let mut family = self.bits_mut();
                    let target = family.get_mut(Table::Coils);
                    let range = span(address, bits.len(), target.len())?;
                    for (slot, value) in target[range].iter_mut().zip(bits.iter()) {
                        *slot = value;
                    }
                }
                Response::WriteCoils {
                    address,
                    quantity: quantity_u16(bits.len())?,
                }
                .encode(&mut w)
                .map_err(map_encode)?;
                self.notify(Table::Coils, address, bits.len());
            }
            DecodedRequest::WriteRegisters { address, words } => {
                self.ensure_enabled(Table::HoldingRegisters)?;
                {
                    let mut family = self.words_mut();
                    let target = family.get_mut(Table::HoldingRegisters);
                    let range = span(address, words.len(), target.len())?;
                    words.copy_to(&mut target[range]);
                }
                Response::WriteRegisters {
                    address,
                    quantity: quantity_u16(words.len())?,
                }
                .encode(&mut w)
                .map_err(map_encode)?;
                self.notify(Table::HoldingRegisters, address, words.len());
            }
            DecodedRequest::MaskWrite(req) => {
                self.ensure_enabled(Table::HoldingRegisters)?;
                self.mask_write(req)?;
                Response::MaskWrite(req).encode(&mut w).map_err(map_encode)?;
                self.notify(Table::HoldingRegisters, req.address, 1);
            }
            DecodedRequest::ReadWriteRegisters {
                read_address,
                read_quantity,
                write_address,
                words,
            } => {
                self.ensure_enabled(Table::HoldingRegisters)?;
                let read_quantity = usize::from(read_quantity);
                let mut bytes = [0u8; MAX_READ_REGISTERS as usize * 2];
                {
                    // The write lands before the read, under one lock.
                    let mut family = self.words_mut();
                    let registers = family.get_mut(Table::HoldingRegisters);
                    let write_range = span(write_address, words.len(), registers.len())?;
                    let read_range = span(read_address, read_quantity, registers.len())?;
                    words.copy_to(&mut registers[write_range]);
                    store_wire_words(&registers[read_range], &mut bytes);
                }
                Response::ReadWriteRegisters {
                    words: WireWords::new(&bytes[..read_quantity * 2]),
                }
                .encode(&mut w)
                .map_err(map_encode)?;
                self.notify(Table::HoldingRegisters, write_address, words.len());
            }
        }

        Ok(w.position())
    }
}

fn span(address: u16, quantity: usize, len: usize) -> Result<Range<usize>, ServiceError> {
    let start = usize::from(address);
    match start.checked_add(quantity) {
        Some(end) if end <= len => Ok(start..end),
        _ => Err(ServiceError::Exception(ExceptionCode::IllegalDataAddress)),
    }
}

fn store_wire_words(words: &[u16], out: &mut [u8]) {
    for (pair, word) in out.chunks_exact_mut(2).zip(words) {
        pair.copy_from_slice(&word.to_be_bytes());
    }
}

fn quantity_u16(quantity: usize) -> Result<u16, ServiceError> {
    u16::try_from(quantity).map_err(|_| ServiceError::InvalidRequest("quantity too large"))
}

fn map_encode(_: EncodeError) -> ServiceError {
    ServiceError::Internal("failed to encode response")
}

#[cfg(test)]
mod tests {
    use super::{ImageChange, ImageConfig, RegisterImage};
    use crate::server::{ModbusService, ServiceError};
    use modlink_core::encoding::{Reader, Writer};
    use modlink_core::pdu::{
        DecodedRequest, ExceptionCode, MaskWriteRequest, ReadRequest, ReadWriteRegistersRequest,
        Request, Table, WriteCoilsRequest, WriteRegisterRequest,
    };

    fn call(image: &RegisterImage, request: Request<'_>) -> Result<Vec<u8>, ServiceError> {
        let mut pdu = [0u8; 260];
        let mut w = Writer::new(&mut pdu);
        request.encode(&mut w).unwrap();
        let len = w.position();
        let decoded = DecodedRequest::decode(&mut Reader::new(&pdu[..len])).unwrap();

        let mut response = [0u8; 253];
        let written = image.handle(1, decoded, &mut response)?;
        Ok(response[..written].to_vec())
    }

    fn read(table: Table, address: u16, quantity: u16) -> Request<'static> {
        Request::Read(ReadRequest {
            table,
            address,
            quantity,
        })
    }

    #[test]
    fn write_then_read_holding_register() {
        let image = RegisterImage::new(ImageConfig::uniform(4));
        let echo = call(
            &image,
            Request::WriteRegister(WriteRegisterRequest {
                address: 0,
                value: 100,
            }),
        )
        .unwrap();
        assert_eq!(echo, vec![0x06, 0x00, 0x00, 0x00, 0x64]);

        let response = call(&image, read(Table::HoldingRegisters, 0, 1)).unwrap();
        assert_eq!(response, vec![0x03, 0x02, 0x00, 0x64]);
    }

    #[test]
    fn reads_packed_coils() {
        let image = RegisterImage::new(ImageConfig::uniform(16));
        image.set_coil(0, true).unwrap();
        image.set_coil(9, true).unwrap();
        let response = call(&image, read(Table::Coils, 0, 10)).unwrap();
        assert_eq!(response, vec![0x01, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn input_tables_are_separate() {
        let image = RegisterImage::new(ImageConfig::uniform(8));
        image.set_input_register(2, 0xBEEF).unwrap();
        image.set_discrete_input(1, true).unwrap();
        assert_eq!(
            call(&image, read(Table::InputRegisters, 2, 1)).unwrap(),
            vec![0x04, 0x02, 0xBE, 0xEF]
        );
        assert_eq!(
            call(&image, read(Table::HoldingRegisters, 2, 1)).unwrap(),
            vec![0x03, 0x02, 0x00, 0x00]
        );
        assert_eq!(
            call(&image, read(Table::DiscreteInputs, 0, 2)).unwrap(),
            vec![0x02, 0x01, 0x02]
        );
        assert_eq!(image.input_register(2), Some(0xBEEF));
        assert_eq!(image.holding_register(2), Some(0));
        assert_eq!(image.discrete_input(1), Some(true));
        assert_eq!(image.input_register(8), None);
    }

    #[test]
    fn out_of_range_is_illegal_address() {
        let image = RegisterImage::new(ImageConfig::uniform(10));
        let err = call(&image, read(Table::HoldingRegisters, 8, 3)).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Exception(ExceptionCode::IllegalDataAddress)
        ));
        assert!(image.set_holding_register(10, 1).is_err());
    }

    #[test]
    fn disabled_table_is_illegal_function() {
        let mut config = ImageConfig::uniform(10);
        config.table_mut(Table::InputRegisters).enabled = false;
        let image = RegisterImage::new(config);
        let err = call(&image, read(Table::InputRegisters, 0, 1)).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Exception(ExceptionCode::IllegalFunction)
        ));
        assert!(call(&image, read(Table::HoldingRegisters, 0, 1)).is_ok());
    }

    #[test]
    fn mask_write_keeps_and_mask_bits() {
        let image = RegisterImage::new(ImageConfig::uniform(4));
        image.set_holding_register(1, 0x0012).unwrap();
        let echo = call(
            &image,
            Request::MaskWrite(MaskWriteRequest {
                address: 1,
                and_mask: 0x00F2,
                or_mask: 0x0025,
            }),
        )
        .unwrap();
        assert_eq!(echo, vec![0x16, 0x00, 0x01, 0x00, 0xF2, 0x00, 0x25]);
        assert_eq!(image.holding_register(1), Some(0x0017));
    }

    #[test]
    fn read_write_registers_writes_first() {
        let image = RegisterImage::new(ImageConfig::uniform(8));
        image.set_holding_register(3, 7).unwrap();
        let response = call(
            &image,
            Request::ReadWriteRegisters(ReadWriteRegistersRequest {
                read_address: 2,
                read_quantity: 3,
                write_address: 3,
                values: &[0x0102, 0x0304],
            }),
        )
        .unwrap();
        assert_eq!(
            response,
            vec![0x17, 0x06, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn writes_emit_changes() {
        let image = RegisterImage::new(ImageConfig::uniform(32));
        let mut changes = image.subscribe();

        call(
            &image,
            Request::WriteCoils(WriteCoilsRequest {
                address: 4,
                values: &[true, false, true],
            }),
        )
        .unwrap();
        call(&image, read(Table::Coils, 0, 8)).unwrap();
        call(
            &image,
            Request::WriteRegister(WriteRegisterRequest {
                address: 9,
                value: 1,
            }),
        )
        .unwrap();

        assert_eq!(
            changes.try_recv().unwrap(),
            ImageChange {
                table: Table::Coils,
                address: 4,
                count: 3
            }
        );
        assert_eq!(
            changes.try_recv().unwrap(),
            ImageChange {
                table: Table::HoldingRegisters,
                address: 9,
                count: 1
            }
        );
        assert!(changes.try_recv().is_err());
        assert_eq!(image.coil(6), Some(true));
        assert_eq!(image.coil(5), Some(false));
    }

    #[test]
    fn host_accessors_bound_check() {
        let image = RegisterImage::new(ImageConfig::uniform(4));
        image.write_words(Table::HoldingRegisters, 1, &[1, 2, 3]).unwrap();
        let mut out = [0u16; 3];
        image.read_words(Table::HoldingRegisters, 1, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert!(image.write_words(Table::HoldingRegisters, 2, &[1, 2, 3]).is_err());

        let mut bits = [false; 2];
        image.write_bits(Table::Coils, 2, &[true, true]).unwrap();
        image.read_bits(Table::Coils, 2, &mut bits).unwrap();
        assert_eq!(bits, [true, true]);
    }
}
