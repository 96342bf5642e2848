//! Savings: single-file Solana program with an embedded interest-bearing
//! savings engine.
//!
//! Depositors move a stable-value SPL token into a program-owned vault and
//! earn time-based interest funded from a separate reserve token account.
//! Accrual is driven by a global tick accumulator (the integral of the
//! annualized rate over time) so that rate changes never require touching
//! individual accounts; each account self-settles lazily against a single
//! stored tick snapshot whenever it is touched.
//!
//! Clients read pool and account state straight from the slab account via
//! [`zc::engine_ref`] and the [`engine::SavingsEngine`] views.

#![deny(unsafe_code)]

// 1. mod constants
pub mod constants {
    use crate::engine::SavingsEngine;
    use crate::state::PoolConfig;
    use core::mem::{align_of, size_of};

    pub const MAGIC: u64 = 0x5341564e47533031; // "SAVNGS01"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<PoolConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<SavingsEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<SavingsEngine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;
}

// 2. mod zc (Zero-Copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use crate::constants::{ENGINE_ALIGN, ENGINE_LEN, ENGINE_OFF};
    use crate::engine::SavingsEngine;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn engine_ref<'a>(data: &'a [u8]) -> Result<&'a SavingsEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const SavingsEngine) })
    }

    #[inline]
    pub fn engine_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut SavingsEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut SavingsEngine) })
    }

    #[inline]
    pub fn engine_write(data: &mut [u8], engine: SavingsEngine) -> Result<(), ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        unsafe { core::ptr::write(ptr as *mut SavingsEngine, engine) };
        Ok(())
    }
}

// 3. mod error
pub mod error {
    use crate::engine::SavingsError;
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;
    use solana_program::decode_error::DecodeError;
    use solana_program::msg;
    use solana_program::program_error::{PrintProgramError, ProgramError};
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, Eq, Error, FromPrimitive, PartialEq)]
    pub enum SavingsProgError {
        #[error("slab account not initialized")]
        NotInitialized,
        #[error("slab account already initialized")]
        AlreadyInitialized,
        #[error("unsupported state version")]
        InvalidVersion,
        #[error("slab account has wrong length")]
        InvalidSlabLen,
        #[error("vault token account mismatch")]
        InvalidVaultAccount,
        #[error("reserve token account mismatch")]
        InvalidReserveAccount,
        #[error("token mint mismatch")]
        InvalidMint,
        #[error("expected signer")]
        ExpectedSigner,
        #[error("expected writable account")]
        ExpectedWritable,
        #[error("clock sysvar is invalid")]
        InvalidClock,
        #[error("funds are still locked")]
        FundsLocked,
        #[error("reserve cannot cover accrued interest")]
        InsufficientReserve,
        #[error("caller may not change the rate")]
        UnauthorizedRateChange,
        #[error("token transfer failed")]
        TokenMoveFailed,
        #[error("savings account not found")]
        AccountNotFound,
        #[error("no free savings account slot")]
        AccountLimitReached,
        #[error("amount must be positive")]
        AmountZero,
        #[error("arithmetic overflow")]
        Overflow,
        #[error("caller does not own this savings account")]
        Unauthorized,
    }

    impl From<SavingsProgError> for ProgramError {
        fn from(e: SavingsProgError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for SavingsProgError {
        fn type_of() -> &'static str {
            "SavingsProgError"
        }
    }

    impl PrintProgramError for SavingsProgError {
        fn print<E>(&self)
        where
            E: 'static + std::error::Error + DecodeError<E> + PrintProgramError + FromPrimitive,
        {
            msg!("{}", self);
        }
    }

    pub fn map_engine_error(e: SavingsError) -> ProgramError {
        let err = match e {
            SavingsError::FundsLocked => SavingsProgError::FundsLocked,
            SavingsError::AccountNotFound => SavingsProgError::AccountNotFound,
            SavingsError::AccountLimitReached => SavingsProgError::AccountLimitReached,
            SavingsError::AmountZero => SavingsProgError::AmountZero,
            SavingsError::Overflow => SavingsProgError::Overflow,
        };
        err.into()
    }
}

// 4. mod engine (pure savings ledger, embedded in the slab)
pub mod engine {
    //! The interest engine: a rate checkpoint plus a fixed slab of
    //! per-account `{balance, lock_tick}` pairs.
    //!
    //! Time is measured in "ticks" = ppm-seconds, the running integral of
    //! the annualized rate (in parts per million) over wall-clock seconds.
    //! `current_ticks(now)` derives the accumulator from the last rate
    //! checkpoint alone, so settlement only ever needs two readings: the
    //! account's stored snapshot and "now". No rate-history table exists.
    //!
    //! An account's `lock_tick` may lie ahead of the accumulator; such
    //! funds are not yet earning and may not be withdrawn. A fresh deposit
    //! pushes the lock `LOCK_PERIOD_SECONDS * rate` ticks past "now",
    //! merged with any existing balance by a balance-weighted average.
    //! The weighted merge is exact for this linear interest model: the
    //! interest later computed from one averaged lock equals the sum of
    //! each tranche's interest computed independently.

    use bytemuck::{Pod, Zeroable};

    /// Rates are expressed in parts per million per year.
    pub const RATE_SCALE_PPM: u64 = 1_000_000;
    pub const SECONDS_PER_YEAR: u64 = 365 * 86_400;
    /// Minimum non-earning holding period applied to fresh deposits.
    pub const LOCK_PERIOD_SECONDS: u64 = 14 * 86_400;

    /// Ticks accumulated by one token-year at scale, the divisor that
    /// turns `balance * ticks` into a token amount.
    const TICKS_DENOM: u128 = (RATE_SCALE_PPM as u128) * (SECONDS_PER_YEAR as u128);

    #[cfg(feature = "test")]
    pub const MAX_ACCOUNTS: usize = 64;
    #[cfg(not(feature = "test"))]
    pub const MAX_ACCOUNTS: usize = 4096;

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum SavingsError {
        FundsLocked,
        AccountNotFound,
        AccountLimitReached,
        AmountZero,
        Overflow,
    }

    /// One depositor: raw token balance and the tick snapshot below which
    /// no interest accrues. `lock_tick > accumulator` means locked.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    pub struct SavingsAccount {
        pub owner: [u8; 32],
        pub balance: u64,
        pub _pad: u64,
        pub lock_tick: u128,
    }

    /// Result of settling an account at a given accumulator reading.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Settlement {
        pub balance: u64,
        pub interest: u64,
        pub lock_tick: u128,
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Withdrawal {
        pub paid: u64,
        pub interest: u64,
    }

    /// Rate ledger and account ledger in one Pod struct so the whole
    /// engine lives zero-copy inside the slab account.
    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SavingsEngine {
        /// Current annualized rate, parts per million.
        pub rate_ppm: u64,
        /// Wall-clock second of the last rate change.
        pub checkpoint_time: u64,
        /// Accumulator value frozen at the last rate change.
        pub checkpoint_ticks: u128,
        pub used: [u8; MAX_ACCOUNTS],
        pub accounts: [SavingsAccount; MAX_ACCOUNTS],
    }

    impl SavingsEngine {
        pub fn new(initial_rate_ppm: u64, now: u64) -> Self {
            let mut engine = Self::zeroed();
            engine.rate_ppm = initial_rate_ppm;
            engine.checkpoint_time = now;
            engine
        }

        /// Accumulator reading at `now`: continuous, piecewise-linear,
        /// monotonic non-decreasing. A clock reading behind the checkpoint
        /// contributes nothing rather than rewinding.
        pub fn current_ticks(&self, now: u64) -> u128 {
            let elapsed = now.saturating_sub(self.checkpoint_time) as u128;
            self.checkpoint_ticks
                .saturating_add((self.rate_ppm as u128).saturating_mul(elapsed))
        }

        /// Freezes a checkpoint at `now` and switches to the new rate, in
        /// that order, so no window exists where the accumulator is
        /// ambiguous. Authorization is the caller's concern.
        pub fn set_rate(&mut self, new_rate_ppm: u64, now: u64) {
            self.checkpoint_ticks = self.current_ticks(now);
            self.checkpoint_time = now.max(self.checkpoint_time);
            self.rate_ppm = new_rate_ppm;
        }

        pub fn is_used(&self, idx: usize) -> bool {
            idx < MAX_ACCOUNTS && self.used[idx] != 0
        }

        pub fn find_account(&self, owner: &[u8; 32]) -> Option<usize> {
            (0..MAX_ACCOUNTS).find(|&i| self.used[i] != 0 && self.accounts[i].owner == *owner)
        }

        /// Allocates a ledger slot for `owner`, or returns the existing
        /// one; one slot per owner.
        pub fn open_account(&mut self, owner: [u8; 32]) -> Result<u16, SavingsError> {
            if let Some(idx) = self.find_account(&owner) {
                return Ok(idx as u16);
            }
            for i in 0..MAX_ACCOUNTS {
                if self.used[i] == 0 {
                    self.used[i] = 1;
                    self.accounts[i] = SavingsAccount {
                        owner,
                        balance: 0,
                        _pad: 0,
                        lock_tick: 0,
                    };
                    return Ok(i as u16);
                }
            }
            Err(SavingsError::AccountLimitReached)
        }

        fn account(&self, idx: usize) -> Result<&SavingsAccount, SavingsError> {
            if !self.is_used(idx) {
                return Err(SavingsError::AccountNotFound);
            }
            Ok(&self.accounts[idx])
        }

        pub fn account_state(&self, idx: usize) -> Option<&SavingsAccount> {
            self.account(idx).ok()
        }

        /// Pure settlement: converts elapsed ticks into realized interest,
        /// rounding down. While the lock lies ahead of the accumulator the
        /// account is untouched, so settling can never erase a live lock.
        fn settle(account: &SavingsAccount, ticks_now: u128) -> Result<Settlement, SavingsError> {
            if ticks_now < account.lock_tick {
                return Ok(Settlement {
                    balance: account.balance,
                    interest: 0,
                    lock_tick: account.lock_tick,
                });
            }
            let elapsed = ticks_now - account.lock_tick;
            let interest_wide = (account.balance as u128)
                .checked_mul(elapsed)
                .ok_or(SavingsError::Overflow)?
                / TICKS_DENOM;
            let interest = u64::try_from(interest_wide).map_err(|_| SavingsError::Overflow)?;
            let balance = account
                .balance
                .checked_add(interest)
                .ok_or(SavingsError::Overflow)?;
            Ok(Settlement {
                balance,
                interest,
                lock_tick: ticks_now,
            })
        }

        /// Settlement preview without mutating anything. The wrapping
        /// operation uses this to source reserve funds before committing.
        pub fn preview(&self, idx: usize, ticks_now: u128) -> Result<Settlement, SavingsError> {
            Self::settle(self.account(idx)?, ticks_now)
        }

        /// Deposit: settle, then merge the fresh tranche (locked until
        /// `ticks_now + rate * LOCK_PERIOD_SECONDS`) with the settled
        /// balance by a balance-weighted average of lock ticks. Returns
        /// the interest realized by the settlement.
        pub fn save(
            &mut self,
            idx: usize,
            amount: u64,
            ticks_now: u128,
        ) -> Result<u64, SavingsError> {
            if amount == 0 {
                return Err(SavingsError::AmountZero);
            }
            let settled = Self::settle(self.account(idx)?, ticks_now)?;
            let lock_offset = (self.rate_ppm as u128).saturating_mul(LOCK_PERIOD_SECONDS as u128);
            let fresh_lock = ticks_now
                .checked_add(lock_offset)
                .ok_or(SavingsError::Overflow)?;
            // settled.lock_tick equals ticks_now once unlocked, or the
            // still-live future lock; either way the average is exact.
            let weighted = (settled.balance as u128)
                .checked_mul(settled.lock_tick)
                .ok_or(SavingsError::Overflow)?
                .checked_add(
                    (amount as u128)
                        .checked_mul(fresh_lock)
                        .ok_or(SavingsError::Overflow)?,
                )
                .ok_or(SavingsError::Overflow)?;
            let total = settled.balance as u128 + amount as u128;
            let balance = settled
                .balance
                .checked_add(amount)
                .ok_or(SavingsError::Overflow)?;

            let account = &mut self.accounts[idx];
            account.balance = balance;
            account.lock_tick = weighted / total;
            Ok(settled.interest)
        }

        /// Withdrawal: settle, reject outright while locked (the unlock
        /// boundary itself is withdrawable), then pay out up to the
        /// settled balance. Overrequesting means "withdraw everything".
        pub fn withdraw(
            &mut self,
            idx: usize,
            requested: u64,
            ticks_now: u128,
        ) -> Result<Withdrawal, SavingsError> {
            let settled = Self::settle(self.account(idx)?, ticks_now)?;
            if ticks_now < settled.lock_tick {
                if requested > 0 {
                    return Err(SavingsError::FundsLocked);
                }
                return Ok(Withdrawal {
                    paid: 0,
                    interest: 0,
                });
            }
            let paid = requested.min(settled.balance);
            let account = &mut self.accounts[idx];
            account.balance = settled.balance - paid;
            account.lock_tick = settled.lock_tick;
            // A drained account goes dormant; its slot is retained.
            Ok(Withdrawal {
                paid,
                interest: settled.interest,
            })
        }

        /// Zero-principal settle-and-persist. Idempotent at a fixed
        /// accumulator reading.
        pub fn refresh(&mut self, idx: usize, ticks_now: u128) -> Result<u64, SavingsError> {
            let settled = Self::settle(self.account(idx)?, ticks_now)?;
            let account = &mut self.accounts[idx];
            account.balance = settled.balance;
            account.lock_tick = settled.lock_tick;
            Ok(settled.interest)
        }
    }
}

// 5. mod ix
pub mod ix {
    use arrayref::array_ref;
    use solana_program::program_error::ProgramError;

    #[derive(Debug, PartialEq, Eq)]
    pub enum Instruction {
        /// Initialize the slab: admin key, custody accounts, initial rate.
        InitPool { initial_rate_ppm: u64 },
        /// Allocate (or find) the signer's ledger slot.
        OpenAccount,
        /// Deposit into any account; the paying signer funds it.
        Save { account_idx: u16, amount: u64 },
        /// Withdraw from the signer's own account to any token account.
        Withdraw { account_idx: u16, amount: u64 },
        /// Settle an account in place; permissionless.
        RefreshBalance { account_idx: u16 },
        /// Checkpoint the accumulator and switch rates; admin only.
        SetRate { new_rate_ppm: u64 },
        /// Fund the interest reserve.
        TopUpReserve { amount: u64 },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => {
                    let initial_rate_ppm = read_u64(&mut rest)?;
                    Ok(Instruction::InitPool { initial_rate_ppm })
                }
                1 => Ok(Instruction::OpenAccount),
                2 => {
                    let account_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Save {
                        account_idx,
                        amount,
                    })
                }
                3 => {
                    let account_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Withdraw {
                        account_idx,
                        amount,
                    })
                }
                4 => {
                    let account_idx = read_u16(&mut rest)?;
                    Ok(Instruction::RefreshBalance { account_idx })
                }
                5 => {
                    let new_rate_ppm = read_u64(&mut rest)?;
                    Ok(Instruction::SetRate { new_rate_ppm })
                }
                6 => {
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::TopUpReserve { amount })
                }
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        if input.len() < 2 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(2);
        *input = rest;
        Ok(u16::from_le_bytes(*array_ref![bytes, 0, 2]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }
}

// 6. mod accounts (validation helpers)
pub mod accounts {
    use crate::error::SavingsProgError;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(SavingsProgError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(SavingsProgError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    /// Authority PDA owning both the vault and the reserve token accounts.
    pub fn derive_pool_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], program_id)
    }
}

// 7. mod state
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN};
    use bytemuck::{Pod, Zeroable};
    use core::cell::{Ref, RefMut};
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        /// Sole key allowed to change the rate.
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct PoolConfig {
        pub token_mint: [u8; 32],
        /// Custody for recorded balances, backed 1:1.
        pub vault_pubkey: [u8; 32],
        /// Pool funding interest payouts, drawn on settlement.
        pub reserve_pubkey: [u8; 32],
        pub pool_authority_bump: u8,
        pub _padding: [u8; 7],
    }

    pub fn slab_data<'a, 'b>(
        ai: &'b AccountInfo<'a>,
    ) -> Result<Ref<'b, &'b mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_data()?)
    }

    pub fn slab_data_mut<'a, 'b>(
        ai: &'b AccountInfo<'a>,
    ) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8]) -> PoolConfig {
        let mut c = PoolConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &PoolConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }
}

// 8. mod collateral (token moves through the SPL token program)
pub mod collateral {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(any(test, feature = "test")))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(any(test, feature = "test"))]
    use solana_program::program_pack::Pack;
    #[cfg(any(test, feature = "test"))]
    use spl_token::state::Account as TokenAccount;

    /// Payer-signed transfer into custody. A payer whose transfer right
    /// has been revoked fails here, loudly, inside the token program.
    pub fn deposit<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
            )
        }
        #[cfg(any(test, feature = "test"))]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    /// PDA-signed transfer out of a pool-owned account; used both for
    /// paying depositors from the vault and for drawing reserve funds
    /// into the vault.
    pub fn withdraw<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
                _signer_seeds,
            )
        }
        #[cfg(any(test, feature = "test"))]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }
}

// 9. mod processor
pub mod processor {
    use crate::{
        accounts, collateral,
        constants::{MAGIC, SLAB_LEN, VERSION},
        engine::SavingsEngine,
        error::{map_engine_error, SavingsProgError},
        ix::Instruction,
        state::{self, PoolConfig, SlabHeader},
        zc,
    };
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };

    fn slab_guard(
        program_id: &Pubkey,
        slab: &AccountInfo,
        data: &[u8],
    ) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(SavingsProgError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(SavingsProgError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(SavingsProgError::InvalidVersion.into());
        }
        Ok(())
    }

    fn check_idx(engine: &SavingsEngine, idx: u16) -> Result<(), ProgramError> {
        if !engine.is_used(idx as usize) {
            return Err(SavingsProgError::AccountNotFound.into());
        }
        Ok(())
    }

    fn verify_custody(
        ai: &AccountInfo,
        expected_owner: &Pubkey,
        expected_mint: &Pubkey,
        expected_pubkey: &Pubkey,
        err: SavingsProgError,
    ) -> Result<(), ProgramError> {
        if ai.key != expected_pubkey {
            return Err(err.into());
        }
        if ai.owner != &spl_token::ID {
            return Err(err.into());
        }
        if ai.data_len() != spl_token::state::Account::LEN {
            return Err(err.into());
        }

        let data = ai.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(SavingsProgError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(err.into());
        }
        Ok(())
    }

    fn read_now(a_clock: &AccountInfo) -> Result<u64, ProgramError> {
        let clock = Clock::from_account_info(a_clock)?;
        u64::try_from(clock.unix_timestamp).map_err(|_| SavingsProgError::InvalidClock.into())
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitPool { initial_rate_ppm } => {
                accounts::expect_len(accounts, 6)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];
                let a_reserve = &accounts[4];
                let a_clock = &accounts[5];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(SavingsProgError::AlreadyInitialized.into());
                }

                let (auth, bump) = accounts::derive_pool_authority(program_id, a_slab.key);
                verify_custody(
                    a_vault,
                    &auth,
                    a_mint.key,
                    a_vault.key,
                    SavingsProgError::InvalidVaultAccount,
                )?;
                verify_custody(
                    a_reserve,
                    &auth,
                    a_mint.key,
                    a_reserve.key,
                    SavingsProgError::InvalidReserveAccount,
                )?;

                let now = read_now(a_clock)?;

                for b in data.iter_mut() {
                    *b = 0;
                }
                zc::engine_write(&mut data, SavingsEngine::new(initial_rate_ppm, now))?;

                let config = PoolConfig {
                    token_mint: a_mint.key.to_bytes(),
                    vault_pubkey: a_vault.key.to_bytes(),
                    reserve_pubkey: a_reserve.key.to_bytes(),
                    pool_authority_bump: bump,
                    _padding: [0; 7],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            }
            Instruction::OpenAccount => {
                accounts::expect_len(accounts, 2)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .open_account(a_owner.key.to_bytes())
                    .map_err(map_engine_error)?;
            }
            Instruction::Save {
                account_idx,
                amount,
            } => {
                accounts::expect_len(accounts, 8)?;
                let a_payer = &accounts[0];
                let a_slab = &accounts[1];
                let a_payer_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_reserve = &accounts[4];
                let a_pool_pda = &accounts[5];
                let a_token = &accounts[6];
                let a_clock = &accounts[7];

                accounts::expect_signer(a_payer)?;
                accounts::expect_writable(a_slab)?;
                if amount == 0 {
                    return Err(SavingsProgError::AmountZero.into());
                }

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_pool_authority(program_id, a_slab.key);
                accounts::expect_key(a_pool_pda, &auth)?;
                verify_custody(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.token_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                    SavingsProgError::InvalidVaultAccount,
                )?;
                verify_custody(
                    a_reserve,
                    &auth,
                    &Pubkey::new_from_array(config.token_mint),
                    &Pubkey::new_from_array(config.reserve_pubkey),
                    SavingsProgError::InvalidReserveAccount,
                )?;

                let now = read_now(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;
                check_idx(engine, account_idx)?;

                let ticks = engine.current_ticks(now);
                let preview = engine
                    .preview(account_idx as usize, ticks)
                    .map_err(map_engine_error)?;

                // Source owed interest before committing anything, so a
                // depleted reserve aborts with the ledger untouched.
                let bump_arr = [config.pool_authority_bump];
                let seeds: [&[u8]; 3] = [b"vault", a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                if preview.interest > 0 {
                    collateral::withdraw(
                        a_token,
                        a_reserve,
                        a_vault,
                        a_pool_pda,
                        preview.interest,
                        &signer_seeds,
                    )
                    .map_err(|_| SavingsProgError::InsufficientReserve)?;
                }
                collateral::deposit(a_token, a_payer_ata, a_vault, a_payer, amount)
                    .map_err(|_| SavingsProgError::TokenMoveFailed)?;

                engine
                    .save(account_idx as usize, amount, ticks)
                    .map_err(map_engine_error)?;
            }
            Instruction::Withdraw {
                account_idx,
                amount,
            } => {
                accounts::expect_len(accounts, 8)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_target_ata = &accounts[3];
                let a_reserve = &accounts[4];
                let a_pool_pda = &accounts[5];
                let a_token = &accounts[6];
                let a_clock = &accounts[7];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_pool_authority(program_id, a_slab.key);
                accounts::expect_key(a_pool_pda, &auth)?;
                verify_custody(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.token_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                    SavingsProgError::InvalidVaultAccount,
                )?;
                verify_custody(
                    a_reserve,
                    &auth,
                    &Pubkey::new_from_array(config.token_mint),
                    &Pubkey::new_from_array(config.reserve_pubkey),
                    SavingsProgError::InvalidReserveAccount,
                )?;

                let now = read_now(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;
                check_idx(engine, account_idx)?;

                let owner = engine.accounts[account_idx as usize].owner;
                if Pubkey::new_from_array(owner) != *a_owner.key {
                    return Err(SavingsProgError::Unauthorized.into());
                }

                let ticks = engine.current_ticks(now);
                let preview = engine
                    .preview(account_idx as usize, ticks)
                    .map_err(map_engine_error)?;
                // Even a partial withdrawal is rejected while the lock is
                // live; checked before any funds move.
                if ticks < preview.lock_tick && amount > 0 {
                    return Err(SavingsProgError::FundsLocked.into());
                }

                let bump_arr = [config.pool_authority_bump];
                let seeds: [&[u8]; 3] = [b"vault", a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                if preview.interest > 0 {
                    collateral::withdraw(
                        a_token,
                        a_reserve,
                        a_vault,
                        a_pool_pda,
                        preview.interest,
                        &signer_seeds,
                    )
                    .map_err(|_| SavingsProgError::InsufficientReserve)?;
                }

                let outcome = engine
                    .withdraw(account_idx as usize, amount, ticks)
                    .map_err(map_engine_error)?;

                if outcome.paid > 0 {
                    collateral::withdraw(
                        a_token,
                        a_vault,
                        a_target_ata,
                        a_pool_pda,
                        outcome.paid,
                        &signer_seeds,
                    )
                    .map_err(|_| SavingsProgError::TokenMoveFailed)?;
                }
            }
            Instruction::RefreshBalance { account_idx } => {
                accounts::expect_len(accounts, 6)?;
                let a_slab = &accounts[0];
                let a_vault = &accounts[1];
                let a_reserve = &accounts[2];
                let a_pool_pda = &accounts[3];
                let a_token = &accounts[4];
                let a_clock = &accounts[5];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_pool_authority(program_id, a_slab.key);
                accounts::expect_key(a_pool_pda, &auth)?;
                verify_custody(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.token_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                    SavingsProgError::InvalidVaultAccount,
                )?;
                verify_custody(
                    a_reserve,
                    &auth,
                    &Pubkey::new_from_array(config.token_mint),
                    &Pubkey::new_from_array(config.reserve_pubkey),
                    SavingsProgError::InvalidReserveAccount,
                )?;

                let now = read_now(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;
                check_idx(engine, account_idx)?;

                let ticks = engine.current_ticks(now);
                let preview = engine
                    .preview(account_idx as usize, ticks)
                    .map_err(map_engine_error)?;

                let bump_arr = [config.pool_authority_bump];
                let seeds: [&[u8]; 3] = [b"vault", a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                if preview.interest > 0 {
                    collateral::withdraw(
                        a_token,
                        a_reserve,
                        a_vault,
                        a_pool_pda,
                        preview.interest,
                        &signer_seeds,
                    )
                    .map_err(|_| SavingsProgError::InsufficientReserve)?;
                }

                engine
                    .refresh(account_idx as usize, ticks)
                    .map_err(map_engine_error)?;
            }
            Instruction::SetRate { new_rate_ppm } => {
                accounts::expect_len(accounts, 3)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let header = state::read_header(&data);
                if Pubkey::new_from_array(header.admin) != *a_admin.key {
                    return Err(SavingsProgError::UnauthorizedRateChange.into());
                }

                let now = read_now(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;
                engine.set_rate(new_rate_ppm, now);
            }
            Instruction::TopUpReserve { amount } => {
                accounts::expect_len(accounts, 5)?;
                let a_payer = &accounts[0];
                let a_slab = &accounts[1];
                let a_payer_ata = &accounts[2];
                let a_reserve = &accounts[3];
                let a_token = &accounts[4];

                accounts::expect_signer(a_payer)?;
                if amount == 0 {
                    return Err(SavingsProgError::AmountZero.into());
                }

                let data = state::slab_data(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_pool_authority(program_id, a_slab.key);
                verify_custody(
                    a_reserve,
                    &auth,
                    &Pubkey::new_from_array(config.token_mint),
                    &Pubkey::new_from_array(config.reserve_pubkey),
                    SavingsProgError::InvalidReserveAccount,
                )?;

                collateral::deposit(a_token, a_payer_ata, a_reserve, a_payer, amount)
                    .map_err(|_| SavingsProgError::TokenMoveFailed)?;
            }
        }
        Ok(())
    }
}

// 10. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use crate::processor;
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}

#[cfg(not(feature = "no-entrypoint"))]
solana_security_txt::security_txt! {
    name: "Savings Program",
    project_url: "https://github.com/savings-labs/savings-prog",
    contacts: "email:security@savingsprog.dev",
    policy: "https://github.com/savings-labs/savings-prog/blob/main/SECURITY.md"
}
