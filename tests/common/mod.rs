// Host model of the sort kernels and counter copies, dispatch by dispatch.
// Mirrors the workgroup structure of radix_sort.wgsl so partition boundaries, the spine and the
// row-by-row scatter are exercised with the crate's real constants.

#![allow(dead_code)]

use rfs_gsplat_sort::{
    dispatch::{
        workgroups_for, CounterCopy, CounterField, DispatchIndirectArgs, DrawIndirectArgs,
        SortInfo, PROPAGATE_COPY, RESET_COPIES,
    },
    preprocess::SortEntry,
    radix_sort::{
        PingPong, PingPongSlot, KEYS_PER_SORT_WORKGROUP, RADIX, SORT_BLOCK_ROWS, SORT_PASSES,
        SORT_WORKGROUP_SIZE, SortPassParams,
    },
};

/// Device buffers of one point cloud.
pub struct DeviceModel {
    pub keys: PingPong<Vec<u32>>,
    pub values: PingPong<Vec<u32>>,
    pub partition_histogram: Vec<u32>,
    pub digit_offsets: Vec<u32>,
    pub sort_info: SortInfo,
    pub dispatch: DispatchIndirectArgs,
    pub draw: DrawIndirectArgs,
}

impl DeviceModel {
    pub fn new(capacity: usize) -> Self {
        let partitions = workgroups_for(capacity as u32, KEYS_PER_SORT_WORKGROUP) as usize;
        Self {
            keys: PingPong {
                a: vec![0; capacity],
                b: vec![0; capacity],
            },
            values: PingPong {
                a: vec![0; capacity],
                b: vec![0; capacity],
            },
            partition_histogram: vec![0; partitions * RADIX],
            digit_offsets: vec![0; RADIX],
            sort_info: SortInfo {
                capacity: capacity as u32,
                ..Default::default()
            },
            dispatch: DispatchIndirectArgs::default(),
            draw: DrawIndirectArgs::default(),
        }
    }

    fn read_field(&self, field: CounterField) -> u32 {
        let bytes: &[u8] = match field {
            CounterField::Zero => return 0,
            CounterField::KeysSize => bytemuck::bytes_of(&self.sort_info),
            CounterField::DispatchX => bytemuck::bytes_of(&self.dispatch),
            CounterField::InstanceCount => bytemuck::bytes_of(&self.draw),
        };
        let offset = field.offset() as usize;
        let size = CounterCopy::SIZE as usize;
        u32::from_le_bytes(bytes[offset..offset + size].try_into().unwrap())
    }

    fn write_field(&mut self, field: CounterField, value: u32) {
        let bytes: &mut [u8] = match field {
            CounterField::Zero => panic!("the zero source is read-only"),
            CounterField::KeysSize => bytemuck::bytes_of_mut(&mut self.sort_info),
            CounterField::DispatchX => bytemuck::bytes_of_mut(&mut self.dispatch),
            CounterField::InstanceCount => bytemuck::bytes_of_mut(&mut self.draw),
        };
        let offset = field.offset() as usize;
        bytes[offset..offset + CounterCopy::SIZE as usize].copy_from_slice(&value.to_le_bytes());
    }

    pub fn copy(&mut self, copy: CounterCopy) {
        let value = self.read_field(copy.source);
        self.write_field(copy.destination, value);
    }

    pub fn reset(&mut self) {
        for copy in RESET_COPIES {
            self.copy(copy);
        }
    }

    pub fn propagate_count(&mut self) {
        self.copy(PROPAGATE_COPY);
    }

    /// What the preprocess kernel does for each visible primitive, in append order.
    pub fn append(&mut self, entries: &[SortEntry]) {
        for entry in entries {
            let slot = self.sort_info.keys_size;
            self.sort_info.keys_size += 1;
            if slot as usize >= self.keys.a.len() {
                self.sort_info.keys_size -= 1;
                continue;
            }
            self.keys.a[slot as usize] = entry.key;
            self.values.a[slot as usize] = entry.index;
            if slot % KEYS_PER_SORT_WORKGROUP == 0 {
                self.dispatch.x += 1;
            }
        }
    }

    fn entry_count(&self) -> usize {
        (self.sort_info.keys_size as usize).min(self.keys.a.len())
    }

    pub fn sort(&mut self) {
        for pass in 0..SORT_PASSES {
            self.sort_pass(pass);
        }
    }

    pub fn sort_pass(&mut self, pass: u32) {
        let params = SortPassParams::for_pass(pass);
        let workgroups = self.dispatch.x as usize;
        let count = self.entry_count();

        let (keys_in, keys_out) = match PingPongSlot::source_for_pass(pass) {
            PingPongSlot::A => (&self.keys.a, &mut self.keys.b),
            PingPongSlot::B => (&self.keys.b, &mut self.keys.a),
        };
        let (values_in, values_out) = match PingPongSlot::source_for_pass(pass) {
            PingPongSlot::A => (&self.values.a, &mut self.values.b),
            PingPongSlot::B => (&self.values.b, &mut self.values.a),
        };
        let digit_of = |key: u32| ((key >> params.bit_shift) as usize) & (RADIX - 1);
        let wg_size = SORT_WORKGROUP_SIZE as usize;
        let block = KEYS_PER_SORT_WORKGROUP as usize;

        // histogram
        for wg in 0..workgroups {
            let mut local = [0u32; RADIX];
            for row in 0..SORT_BLOCK_ROWS as usize {
                for t in 0..wg_size {
                    let idx = wg * block + row * wg_size + t;
                    if idx < count {
                        local[digit_of(keys_in[idx])] += 1;
                    }
                }
            }
            self.partition_histogram[wg * RADIX..(wg + 1) * RADIX].copy_from_slice(&local);
        }

        // spine
        let partitions = count.div_ceil(block);
        let mut totals = [0u32; RADIX];
        for (digit, total) in totals.iter_mut().enumerate() {
            let mut running = 0;
            for p in 0..partitions {
                let slot = p * RADIX + digit;
                let c = self.partition_histogram[slot];
                self.partition_histogram[slot] = running;
                running += c;
            }
            *total = running;
        }
        let mut sum = 0;
        for (digit, total) in totals.iter().enumerate() {
            self.digit_offsets[digit] = sum;
            sum += total;
        }

        // scatter
        for wg in 0..workgroups {
            let mut digit_base: Vec<u32> = (0..RADIX)
                .map(|d| self.digit_offsets[d] + self.partition_histogram[wg * RADIX + d])
                .collect();
            for row in 0..SORT_BLOCK_ROWS as usize {
                let row_digits: Vec<Option<usize>> = (0..wg_size)
                    .map(|t| {
                        let idx = wg * block + row * wg_size + t;
                        (idx < count).then(|| digit_of(keys_in[idx]))
                    })
                    .collect();
                let mut row_counts = [0u32; RADIX];
                for (t, digit) in row_digits.iter().enumerate() {
                    let Some(digit) = *digit else { continue };
                    let idx = wg * block + row * wg_size + t;
                    let dest = (digit_base[digit] + row_counts[digit]) as usize;
                    keys_out[dest] = keys_in[idx];
                    values_out[dest] = values_in[idx];
                    row_counts[digit] += 1;
                }
                for (base, added) in digit_base.iter_mut().zip(row_counts) {
                    *base += added;
                }
            }
        }
    }

    /// First `keys_size` sorted (key, value) pairs.
    pub fn sorted(&self) -> (Vec<u32>, Vec<u32>) {
        let count = self.entry_count();
        (
            self.keys.output()[..count].to_vec(),
            self.values.output()[..count].to_vec(),
        )
    }
}

/// Stable host sort of the same entries, the expected device output.
pub fn reference_sort(entries: &[SortEntry]) -> (Vec<u32>, Vec<u32>) {
    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|entry| entry.key);
    (
        sorted.iter().map(|e| e.key).collect(),
        sorted.iter().map(|e| e.index).collect(),
    )
}

pub fn entries_from_keys(keys: &[u32]) -> Vec<SortEntry> {
    keys.iter()
        .enumerate()
        .map(|(index, &key)| SortEntry {
            key,
            index: index as u32,
        })
        .collect()
}

/// Run RESET, the appends, every sort pass and PROPAGATE_COUNT on a fresh model.
pub fn sort_on_model(capacity: usize, entries: &[SortEntry]) -> DeviceModel {
    let mut model = DeviceModel::new(capacity);
    model.reset();
    model.append(entries);
    model.sort();
    model.propagate_count();
    model
}
