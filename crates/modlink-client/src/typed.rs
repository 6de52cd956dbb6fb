use crate::chunk::{ChunkPlan, READ_BIT_LIMIT, READ_REGISTER_LIMIT, WRITE_COIL_LIMIT, WRITE_REGISTER_LIMIT};
use crate::{ClientError, ModbusClient};
use modlink_core::codec::{decode_text, encode_text, encode_values};
use modlink_core::pdu::Table;
use modlink_core::{RegisterValue, ScalarKind, Value};
use modlink_datalink::DataLink;

fn register_table(input: bool) -> Table {
    Table::select(false, input)
}

impl<D: DataLink> ModbusClient<D> {
    /// Read `count` registers, splitting so that no `width`-register value
    /// spans two requests.
    pub(crate) async fn read_words_aligned(
        &self,
        table: Table,
        address: u16,
        count: usize,
        width: usize,
    ) -> Result<Vec<u16>, ClientError> {
        let mut out = Vec::with_capacity(count);
        for chunk in ChunkPlan::new(address, count, READ_REGISTER_LIMIT, width)? {
            let words = match table {
                Table::InputRegisters => self.read_input_registers(chunk.address, chunk.units).await?,
                Table::HoldingRegisters => {
                    self.read_holding_registers(chunk.address, chunk.units)
                        .await?
                }
                _ => return Err(ClientError::Validation("not a register table")),
            };
            out.extend_from_slice(&words);
        }
        Ok(out)
    }

    pub(crate) async fn write_words_aligned(
        &self,
        address: u16,
        words: &[u16],
        width: usize,
    ) -> Result<(), ClientError> {
        for chunk in ChunkPlan::new(address, words.len(), WRITE_REGISTER_LIMIT, width)? {
            self.write_multiple_registers(chunk.address, &words[chunk.range()])
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn read_bits_chunked(
        &self,
        table: Table,
        address: u16,
        count: usize,
    ) -> Result<Vec<bool>, ClientError> {
        let mut out = Vec::with_capacity(count);
        for chunk in ChunkPlan::new(address, count, READ_BIT_LIMIT, 1)? {
            let bits = match table {
                Table::Coils => self.read_coils(chunk.address, chunk.units).await?,
                Table::DiscreteInputs => {
                    self.read_discrete_inputs(chunk.address, chunk.units)
                        .await?
                }
                _ => return Err(ClientError::Validation("not a bit table")),
            };
            out.extend_from_slice(&bits);
        }
        Ok(out)
    }

    /// Any number of holding (or, with `input`, input) registers.
    pub async fn read_words(&self, address: u16, count: usize, input: bool) -> Result<Vec<u16>, ClientError> {
        self.read_words_aligned(register_table(input), address, count, 1)
            .await
    }

    /// Any number of holding registers, written with FC16.
    pub async fn write_words(&self, address: u16, words: &[u16]) -> Result<(), ClientError> {
        self.write_words_aligned(address, words, 1).await
    }

    /// Any number of coils (or, with `input`, discrete inputs).
    pub async fn read_bools(&self, address: u16, quantity: usize, input: bool) -> Result<Vec<bool>, ClientError> {
        self.read_bits_chunked(Table::select(true, input), address, quantity)
            .await
    }

    /// Any number of coils, written with FC15.
    pub async fn write_bools(&self, address: u16, values: &[bool]) -> Result<(), ClientError> {
        for chunk in ChunkPlan::new(address, values.len(), WRITE_COIL_LIMIT, 1)? {
            self.write_multiple_coils(chunk.address, &values[chunk.range()])
                .await?;
        }
        Ok(())
    }

    pub async fn read<T: RegisterValue>(&self, address: u16, input: bool) -> Result<T, ClientError> {
        self.read_many::<T>(address, 1, input)
            .await?
            .first()
            .copied()
            .ok_or(ClientError::InvalidResponse("empty register payload"))
    }

    /// `quantity` consecutive values, decoded in the configured word order.
    pub async fn read_many<T: RegisterValue>(
        &self,
        address: u16,
        quantity: usize,
        input: bool,
    ) -> Result<Vec<T>, ClientError> {
        let count = quantity
            .checked_mul(T::WORDS)
            .ok_or(ClientError::Validation("quantity too large"))?;
        let words = self
            .read_words_aligned(register_table(input), address, count, T::WORDS)
            .await?;
        let order = self.config.word_order;
        words
            .chunks_exact(T::WORDS)
            .map(|chunk| T::from_words(chunk, order).map_err(ClientError::from))
            .collect()
    }

    pub async fn write<T: RegisterValue>(&self, address: u16, value: T) -> Result<(), ClientError> {
        self.write_many(address, &[value]).await
    }

    pub async fn write_many<T: RegisterValue>(&self, address: u16, values: &[T]) -> Result<(), ClientError> {
        let mut words = vec![0u16; values.len() * T::WORDS];
        encode_values(values, self.config.word_order, &mut words)?;
        self.write_words_aligned(address, &words, T::WORDS).await
    }

    /// Read one value whose kind is only known at runtime.
    ///
    /// [`ScalarKind::Bit`] reads a coil or discrete input; text needs an
    /// explicit length and goes through [`Self::read_text`].
    pub async fn read_value(&self, kind: ScalarKind, address: u16, input: bool) -> Result<Value, ClientError> {
        match kind {
            ScalarKind::Bit => {
                let bits = self
                    .read_bits_chunked(Table::select(true, input), address, 1)
                    .await?;
                bits.first()
                    .copied()
                    .map(Value::Bit)
                    .ok_or(ClientError::InvalidResponse("empty bit payload"))
            }
            ScalarKind::Text => Err(ClientError::PointKind("text values need an explicit length")),
            _ => {
                let width = kind.words().unwrap_or(1);
                let words = self
                    .read_words_aligned(register_table(input), address, width, width)
                    .await?;
                Ok(Value::from_words(kind, &words, self.config.word_order)?)
            }
        }
    }

    /// Write one value of any kind: bits to a coil, text as packed bytes,
    /// numbers in the configured word order.
    pub async fn write_value(&self, address: u16, value: &Value) -> Result<(), ClientError> {
        match value {
            Value::Bit(bit) => self.write_bools(address, &[*bit]).await,
            Value::Text(text) => {
                self.write_text(address, text, text.len().div_ceil(2).max(1))
                    .await
            }
            _ => {
                let words = value.to_words(self.config.word_order)?;
                self.write_words_aligned(address, &words, words.len())
                    .await
            }
        }
    }

    /// `words` registers as UTF-8 text, trailing NULs removed.
    pub async fn read_text(&self, address: u16, words: usize, input: bool) -> Result<String, ClientError> {
        let raw = self.read_words(address, words, input).await?;
        Ok(decode_text(&raw))
    }

    /// Write `text` into exactly `words` registers, truncated or NUL padded.
    pub async fn write_text(&self, address: u16, text: &str, words: usize) -> Result<(), ClientError> {
        let mut raw = vec![0u16; words];
        encode_text(text, &mut raw);
        self.write_words(address, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::MockLink;
    use crate::{ClientConfig, ClientError, ModbusClient};
    use modlink_core::{ScalarKind, Value, WordOrder};

    fn read_response(words: &[u16]) -> Vec<u8> {
        let mut pdu = vec![0x03, (words.len() * 2) as u8];
        for word in words {
            pdu.extend_from_slice(&word.to_be_bytes());
        }
        pdu
    }

    #[tokio::test]
    async fn reads_u32_low_word_first() {
        let link = MockLink::with_responses(vec![Ok(read_response(&[0x5678, 0x1234]))]);
        let client = ModbusClient::new(link);
        let value: u32 = client.read(0, false).await.unwrap();
        assert_eq!(value, 0x1234_5678);
    }

    #[tokio::test]
    async fn writes_f32_high_word_first() {
        let link = MockLink::with_responses(vec![Ok(vec![0x10, 0x00, 0x08, 0x00, 0x02])]);
        let probe = link.clone();
        let config = ClientConfig::default().with_word_order(WordOrder::HighLow);
        let client = ModbusClient::with_config(link, config);

        client.write(8, 1.0f32).await.unwrap();
        assert_eq!(
            probe.requests(),
            vec![vec![0x10, 0x00, 0x08, 0x00, 0x02, 0x04, 0x3F, 0x80, 0x00, 0x00]]
        );
    }

    #[tokio::test]
    async fn long_reads_are_chunked_in_order() {
        let first: Vec<u16> = (0..124).collect();
        let second: Vec<u16> = (124..200).collect();
        let link = MockLink::with_responses(vec![
            Ok(read_response(&first)),
            Ok(read_response(&second)),
        ]);
        let probe = link.clone();
        let client = ModbusClient::new(link);

        let words = client.read_words(1000, 200, false).await.unwrap();
        assert_eq!(words, (0..200).collect::<Vec<u16>>());
        let requests = probe.requests();
        assert_eq!(requests[0], vec![0x03, 0x03, 0xE8, 0x00, 124]);
        // 1000 + 124 = 1124 = 0x0464
        assert_eq!(requests[1], vec![0x03, 0x04, 0x64, 0x00, 76]);
    }

    #[tokio::test]
    async fn failed_chunk_aborts_the_call() {
        let first: Vec<u16> = vec![0; 124];
        let link = MockLink::with_responses(vec![Ok(read_response(&first)), Ok(vec![0x83, 0x02])]);
        let client = ModbusClient::new(link);
        let err = client.read_words(0, 130, false).await.unwrap_err();
        assert!(matches!(err, ClientError::Exception(_)));
    }

    #[tokio::test]
    async fn dynamic_values_dispatch_by_kind() {
        let link = MockLink::with_responses(vec![
            Ok(read_response(&[0xFFFE])),
            Ok(vec![0x01, 0x01, 0x01]),
        ]);
        let client = ModbusClient::new(link);

        let value = client.read_value(ScalarKind::I16, 5, false).await.unwrap();
        assert_eq!(value, Value::I16(-2));
        let value = client.read_value(ScalarKind::Bit, 5, false).await.unwrap();
        assert_eq!(value, Value::Bit(true));
        assert!(matches!(
            client.read_value(ScalarKind::Text, 5, false).await,
            Err(ClientError::PointKind(_))
        ));
    }

    #[tokio::test]
    async fn text_is_padded_to_the_requested_length() {
        let link = MockLink::with_responses(vec![Ok(vec![0x10, 0x00, 0x00, 0x00, 0x03])]);
        let probe = link.clone();
        let client = ModbusClient::new(link);

        client.write_text(0, "abc", 3).await.unwrap();
        assert_eq!(
            probe.requests()[0],
            vec![0x10, 0x00, 0x00, 0x00, 0x03, 0x06, b'a', b'b', b'c', 0x00, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn reads_text() {
        let link = MockLink::with_responses(vec![Ok(read_response(&[0x6869, 0x2100]))]);
        let client = ModbusClient::new(link);
        assert_eq!(client.read_text(0, 2, false).await.unwrap(), "hi!");
    }
}
