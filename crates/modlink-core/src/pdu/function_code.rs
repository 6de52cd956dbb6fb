use crate::DecodeError;
use core::fmt;

/// The ten supported Modbus function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
    MaskWriteRegister,
    ReadWriteMultipleRegisters,
}

impl FunctionCode {
    pub const ALL: [Self; 10] = [
        Self::ReadCoils,
        Self::ReadDiscreteInputs,
        Self::ReadHoldingRegisters,
        Self::ReadInputRegisters,
        Self::WriteSingleCoil,
        Self::WriteSingleRegister,
        Self::WriteMultipleCoils,
        Self::WriteMultipleRegisters,
        Self::MaskWriteRegister,
        Self::ReadWriteMultipleRegisters,
    ];

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
            Self::MaskWriteRegister => 0x16,
            Self::ReadWriteMultipleRegisters => 0x17,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_u8() == value)
            .ok_or(DecodeError::InvalidFunctionCode)
    }

    pub const fn is_exception(value: u8) -> bool {
        (value & 0x80) != 0
    }

    /// True when the request changes slave state.
    pub const fn is_write(self) -> bool {
        !matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    /// The table a request with this code touches first.
    pub const fn table(self) -> Table {
        match self {
            Self::ReadCoils | Self::WriteSingleCoil | Self::WriteMultipleCoils => Table::Coils,
            Self::ReadDiscreteInputs => Table::DiscreteInputs,
            Self::ReadInputRegisters => Table::InputRegisters,
            Self::ReadHoldingRegisters
            | Self::WriteSingleRegister
            | Self::WriteMultipleRegisters
            | Self::MaskWriteRegister
            | Self::ReadWriteMultipleRegisters => Table::HoldingRegisters,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.as_u8())
    }
}

/// One of the four Modbus data tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Table {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl Table {
    pub const fn is_bit(self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Coils | Self::HoldingRegisters)
    }

    pub const fn read_function(self) -> FunctionCode {
        match self {
            Self::Coils => FunctionCode::ReadCoils,
            Self::DiscreteInputs => FunctionCode::ReadDiscreteInputs,
            Self::HoldingRegisters => FunctionCode::ReadHoldingRegisters,
            Self::InputRegisters => FunctionCode::ReadInputRegisters,
        }
    }

    /// The read-only table of the same width when `input` is set.
    pub const fn select(bits: bool, input: bool) -> Self {
        match (bits, input) {
            (true, false) => Self::Coils,
            (true, true) => Self::DiscreteInputs,
            (false, false) => Self::HoldingRegisters,
            (false, true) => Self::InputRegisters,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Coils => "coils",
            Self::DiscreteInputs => "discrete inputs",
            Self::HoldingRegisters => "holding registers",
            Self::InputRegisters => "input registers",
        })
    }
}
