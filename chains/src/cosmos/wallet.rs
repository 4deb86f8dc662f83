//! Key handling and transaction signing for the IBC chain.

use anyhow::Context;
use cosmrs::{
    crypto::secp256k1::SigningKey,
    tx::{Body, Fee, SignDoc, SignerInfo},
    AccountId, Any, Coin,
};

/// Standard Cosmos derivation path.
const DERIVATION_PATH: &str = "m/44'/118'/0'/0/0";

pub struct CosmosWallet {
    signing_key: SigningKey,
    account_id: AccountId,
}

impl CosmosWallet {
    pub fn from_mnemonic(mnemonic: &str, address_prefix: &str) -> anyhow::Result<Self> {
        let mnemonic =
            bip39::Mnemonic::parse(mnemonic.trim()).context("invalid bip39 mnemonic")?;
        let seed = mnemonic.to_seed("");
        let path = DERIVATION_PATH
            .parse()
            .context("invalid derivation path")?;
        let signing_key =
            SigningKey::derive_from_path(seed, &path).context("deriving signing key")?;
        let account_id = signing_key
            .public_key()
            .account_id(address_prefix)
            .map_err(|err| anyhow::anyhow!("deriving account id: {err}"))?;
        Ok(Self {
            signing_key,
            account_id,
        })
    }

    pub fn address(&self) -> String {
        self.account_id.to_string()
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Sign a transaction carrying `msgs` and return the raw broadcast
    /// bytes.
    pub fn sign_tx(
        &self,
        msgs: Vec<Any>,
        fee: Fee,
        chain_id: &str,
        account_number: u64,
        sequence: u64,
        memo: &str,
    ) -> anyhow::Result<Vec<u8>> {
        let body = Body::new(msgs, memo, 0u32);
        let auth_info =
            SignerInfo::single_direct(Some(self.signing_key.public_key()), sequence).auth_info(fee);
        let chain_id = chain_id
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid chain id: {err}"))?;
        let sign_doc = SignDoc::new(&body, &auth_info, &chain_id, account_number)
            .map_err(|err| anyhow::anyhow!("building sign doc: {err}"))?;
        let raw = sign_doc
            .sign(&self.signing_key)
            .map_err(|err| anyhow::anyhow!("signing transaction: {err}"))?;
        raw.to_bytes()
            .map_err(|err| anyhow::anyhow!("encoding signed transaction: {err}"))
    }

    /// Fee paid from a gas limit and a per-unit gas price.
    pub fn fee(gas_limit: u64, gas_price: f64, denom: &str) -> anyhow::Result<Fee> {
        let amount = (gas_limit as f64 * gas_price).ceil() as u128;
        let coin = Coin {
            denom: denom
                .parse()
                .map_err(|err| anyhow::anyhow!("invalid denom {denom:?}: {err}"))?,
            amount,
        };
        Ok(Fee::from_amount_and_gas(coin, gas_limit))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn derives_a_stable_address() {
        let wallet = CosmosWallet::from_mnemonic(TEST_MNEMONIC, "cosmos").unwrap();
        let address = wallet.address();
        assert!(address.starts_with("cosmos1"), "{address}");
        // Deterministic derivation: same mnemonic, same address.
        let again = CosmosWallet::from_mnemonic(TEST_MNEMONIC, "cosmos").unwrap();
        assert_eq!(address, again.address());
    }

    #[test]
    fn rejects_garbage_mnemonics() {
        assert!(CosmosWallet::from_mnemonic("not a mnemonic", "cosmos").is_err());
    }

    #[test]
    fn fee_rounds_up() {
        let fee = CosmosWallet::fee(400_000, 0.025, "uatom").unwrap();
        assert_eq!(fee.amount[0].amount, 10_000);
        assert_eq!(fee.gas_limit, 400_000);
    }
}
