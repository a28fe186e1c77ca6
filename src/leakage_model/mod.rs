//! Intermediate values targeted by the attacks.
//!
//! A [`LeakageTarget`] combines a [`Cipher`], a [`LeakageModel`] and the attacked byte
//! position, and maps a plaintext and a key byte hypothesis to a leakage class.
use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::Error;

pub mod aes;

pub use aes::Aes;

pub fn hw(value: usize) -> usize {
    value.count_ones() as usize
}

/// Cipher whose first round substitution is attacked.
pub trait Cipher: Sync {
    /// Returns the substitution box applied to the byte at `target_byte`.
    fn sbox(&self, target_byte: usize) -> &[u8; 256];

    /// Returns the key byte mixed with the attacked plaintext byte.
    fn attacked_key_byte(&self, key: &[u8], target_byte: usize) -> u8 {
        key[target_byte]
    }

    /// Returns the plaintext byte mixed with the attacked key byte.
    fn attacked_plaintext_byte(&self, plaintext: ArrayView1<u8>, target_byte: usize) -> u8 {
        plaintext[target_byte]
    }
}

/// Leakage point of the attack, defining how intermediate values are grouped in classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LeakageModel {
    /// Hamming weight of the S-box output (9 classes)
    #[serde(rename = "hw(sbox)")]
    HammingWeightOfSbox,
    /// Most significant bit of the key addition output (2 classes)
    #[serde(rename = "xor_bit")]
    XorBit,
    /// S-box output (256 classes)
    #[default]
    #[serde(rename = "sbox")]
    SboxOutput,
    /// Key addition output (256 classes)
    #[serde(rename = "xor_byte")]
    XorByte,
}

impl LeakageModel {
    pub const ALL: [LeakageModel; 4] = [
        LeakageModel::HammingWeightOfSbox,
        LeakageModel::XorBit,
        LeakageModel::SboxOutput,
        LeakageModel::XorByte,
    ];

    /// Returns the number of classes produced by [`LeakageModel::classify`].
    pub fn num_classes(&self) -> usize {
        match self {
            LeakageModel::HammingWeightOfSbox => 9,
            LeakageModel::XorBit => 2,
            LeakageModel::SboxOutput | LeakageModel::XorByte => 256,
        }
    }

    /// Returns the class of the intermediate value computed from a plaintext byte and a key
    /// byte.
    pub fn classify(&self, sbox: &[u8; 256], plaintext_byte: u8, key_byte: u8) -> usize {
        let xor = plaintext_byte ^ key_byte;
        match self {
            LeakageModel::HammingWeightOfSbox => hw(sbox[xor as usize] as usize),
            LeakageModel::XorBit => (xor >> 7) as usize,
            LeakageModel::SboxOutput => sbox[xor as usize] as usize,
            LeakageModel::XorByte => xor as usize,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LeakageModel::HammingWeightOfSbox => "hw(sbox)",
            LeakageModel::XorBit => "xor_bit",
            LeakageModel::SboxOutput => "sbox",
            LeakageModel::XorByte => "xor_byte",
        }
    }
}

impl fmt::Display for LeakageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LeakageModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LeakageModel::ALL
            .into_iter()
            .find(|model| model.name() == s)
            .ok_or_else(|| Error::UnknownLeakageMode(s.to_string()))
    }
}

/// Classifies traces by the intermediate value of one byte of a cipher.
#[derive(Debug, Clone)]
pub struct LeakageTarget<C: Cipher = Aes> {
    cipher: C,
    model: LeakageModel,
    target_byte: usize,
}

impl<C: Cipher> LeakageTarget<C> {
    /// Fails with [`Error::InvalidTargetByte`] if `target_byte` is not lower than 16.
    pub fn new(cipher: C, model: LeakageModel, target_byte: usize) -> Result<Self, Error> {
        if target_byte >= 16 {
            return Err(Error::InvalidTargetByte(target_byte));
        }

        Ok(Self {
            cipher,
            model,
            target_byte,
        })
    }

    pub fn model(&self) -> LeakageModel {
        self.model
    }

    pub fn target_byte(&self) -> usize {
        self.target_byte
    }

    pub fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    /// Fails with [`Error::ShapeMismatch`] if plaintexts of `len` bytes do not contain the
    /// target byte.
    pub fn check_plaintext_len(&self, len: usize) -> Result<(), Error> {
        if len <= self.target_byte {
            return Err(Error::ShapeMismatch(format!(
                "plaintexts have {len} bytes, target byte is {}",
                self.target_byte
            )));
        }
        Ok(())
    }

    /// Returns the attacked byte of a full key.
    pub fn key_byte(&self, key: &[u8]) -> u8 {
        self.cipher.attacked_key_byte(key, self.target_byte)
    }

    /// Returns the class of a plaintext under the key byte hypothesis `key_byte`.
    pub fn classify(&self, plaintext: ArrayView1<u8>, key_byte: u8) -> usize {
        self.model.classify(
            self.cipher.sbox(self.target_byte),
            self.cipher
                .attacked_plaintext_byte(plaintext, self.target_byte),
            key_byte,
        )
    }

    /// Returns the class of every plaintext, one per row, under the key byte hypothesis
    /// `key_byte`.
    pub fn classify_batch(&self, plaintexts: ArrayView2<u8>, key_byte: u8) -> Vec<usize> {
        plaintexts
            .rows()
            .into_iter()
            .map(|plaintext| self.classify(plaintext, key_byte))
            .collect()
    }
}
