//! Paper trading broker
//!
//! Real quotes from any [`MarketData`] source, simulated fills. Buys fill at
//! the ask and sells at the bid. Stops and targets are checked against the
//! current tick whenever positions are listed.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::info;

use super::{
    Broker, BrokerError, BrokerPosition, BrokerResult, ClosedTrade, MarketData, OrderReceipt,
    OrderRequest, RETCODE_DONE,
};
use crate::{AccountSnapshot, Candle, InstrumentInfo, Side, Symbol, Tick, Timeframe};

#[derive(Debug, Clone)]
struct PaperPosition {
    position: BrokerPosition,
    contract_size: f64,
    /// Profit already banked by partial closes
    realized: f64,
}

impl PaperPosition {
    fn pnl_at(&self, price: f64, volume: f64) -> f64 {
        (price - self.position.open_price) * self.position.side.sign() * volume * self.contract_size
    }

    /// Stop or target crossed by `tick`, with the level it fills at
    fn triggered(&self, tick: &Tick) -> Option<(f64, &'static str)> {
        let p = &self.position;
        let price = tick.exit_price(p.side);
        match p.side {
            Side::Buy => {
                if p.sl > 0.0 && price <= p.sl {
                    Some((p.sl, "sl"))
                } else if p.tp > 0.0 && price >= p.tp {
                    Some((p.tp, "tp"))
                } else {
                    None
                }
            }
            Side::Sell => {
                if p.sl > 0.0 && price >= p.sl {
                    Some((p.sl, "sl"))
                } else if p.tp > 0.0 && price <= p.tp {
                    Some((p.tp, "tp"))
                } else {
                    None
                }
            }
        }
    }
}

pub struct PaperBroker<M: MarketData> {
    market: M,
    balance: f64,
    currency: String,
    open: Vec<PaperPosition>,
    closed: HashMap<u64, ClosedTrade>,
    next_ticket: u64,
}

impl<M: MarketData> PaperBroker<M> {
    pub fn new(market: M, starting_balance: f64) -> Self {
        info!("Paper broker initialized with balance {:.2}", starting_balance);
        PaperBroker {
            market,
            balance: starting_balance,
            currency: "USD".to_string(),
            open: Vec::new(),
            closed: HashMap::new(),
            next_ticket: 1,
        }
    }

    pub fn market(&self) -> &M {
        &self.market
    }

    pub fn market_mut(&mut self) -> &mut M {
        &mut self.market
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    fn finalize(&mut self, index: usize, price: f64, time: DateTime<Utc>, reason: &str) {
        let paper = self.open.remove(index);
        let pnl = paper.pnl_at(price, paper.position.volume);
        self.balance += pnl;

        let p = paper.position;
        info!(
            "Paper position {} {} closed at {} ({}), pnl {:.2}",
            p.ticket, p.symbol, price, reason, pnl + paper.realized
        );
        self.closed.insert(
            p.ticket,
            ClosedTrade {
                ticket: p.ticket,
                symbol: p.symbol,
                side: p.side,
                volume: p.volume,
                open_price: p.open_price,
                close_price: price,
                profit: pnl + paper.realized,
                open_time: p.open_time,
                close_time: time,
                reason: reason.to_string(),
            },
        );
    }

    /// Close positions whose stop or target was crossed by the current tick
    fn settle_triggers(&mut self) -> BrokerResult<()> {
        let mut index = 0;
        while index < self.open.len() {
            let tick = self.market.tick(&self.open[index].position.symbol)?;
            match self.open[index].triggered(&tick) {
                Some((price, reason)) => self.finalize(index, price, tick.time, reason),
                None => {
                    let paper = &mut self.open[index];
                    let mark = tick.exit_price(paper.position.side);
                    paper.position.profit = paper.pnl_at(mark, paper.position.volume);
                    index += 1;
                }
            }
        }
        Ok(())
    }

    fn index_of(&self, ticket: u64) -> BrokerResult<usize> {
        self.open
            .iter()
            .position(|p| p.position.ticket == ticket)
            .ok_or(BrokerError::UnknownTicket(ticket))
    }
}

impl<M: MarketData> MarketData for PaperBroker<M> {
    fn bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> BrokerResult<Vec<Candle>> {
        self.market.bars(symbol, timeframe, count)
    }

    fn tick(&self, symbol: &Symbol) -> BrokerResult<Tick> {
        self.market.tick(symbol)
    }

    fn instrument(&self, symbol: &Symbol) -> BrokerResult<InstrumentInfo> {
        self.market.instrument(symbol)
    }

    fn server_time(&self) -> BrokerResult<DateTime<Utc>> {
        self.market.server_time()
    }
}

impl<M: MarketData> Broker for PaperBroker<M> {
    fn account(&mut self) -> BrokerResult<AccountSnapshot> {
        self.settle_triggers()?;
        let unrealized: f64 = self.open.iter().map(|p| p.position.profit).sum();
        Ok(AccountSnapshot {
            balance: self.balance,
            equity: self.balance + unrealized,
            currency: self.currency.clone(),
        })
    }

    fn positions(
        &mut self,
        symbol: Option<&Symbol>,
        magic: u64,
    ) -> BrokerResult<Vec<BrokerPosition>> {
        self.settle_triggers()?;
        Ok(self
            .open
            .iter()
            .map(|p| &p.position)
            .filter(|p| p.magic == magic && symbol.map_or(true, |s| &p.symbol == s))
            .cloned()
            .collect())
    }

    fn send_order(&mut self, request: &OrderRequest) -> BrokerResult<OrderReceipt> {
        if request.volume <= 0.0 {
            return Err(BrokerError::Rejected {
                operation: "order_send",
                code: 10014,
                description: "Invalid volume".to_string(),
            });
        }

        let tick = self.market.tick(&request.symbol)?;
        let instrument = self.market.instrument(&request.symbol)?;
        let price = tick.entry_price(request.side);

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        self.open.push(PaperPosition {
            position: BrokerPosition {
                ticket,
                symbol: request.symbol.clone(),
                side: request.side,
                volume: request.volume,
                open_price: price,
                sl: request.sl,
                tp: request.tp,
                open_time: tick.time,
                profit: 0.0,
                magic: request.magic,
                comment: request.comment.clone(),
            },
            contract_size: instrument.contract_size,
            realized: 0.0,
        });

        info!(
            "Paper {} {} {:.2} @ {} (ticket {})",
            request.side, request.symbol, request.volume, price, ticket
        );

        Ok(OrderReceipt {
            retcode: RETCODE_DONE,
            ticket,
            volume: request.volume,
            price,
            comment: "paper fill".to_string(),
        })
    }

    fn modify_stops(&mut self, ticket: u64, sl: f64, tp: f64) -> BrokerResult<()> {
        let index = self.index_of(ticket)?;
        let position = &mut self.open[index].position;
        position.sl = sl;
        position.tp = tp;
        Ok(())
    }

    fn close_position(&mut self, ticket: u64, volume: f64) -> BrokerResult<OrderReceipt> {
        let index = self.index_of(ticket)?;
        let tick = self.market.tick(&self.open[index].position.symbol)?;
        let price = tick.exit_price(self.open[index].position.side);

        let open_volume = self.open[index].position.volume;
        let volume = volume.min(open_volume);

        if open_volume - volume < 1e-9 {
            self.finalize(index, price, tick.time, "close");
        } else {
            let paper = &mut self.open[index];
            let pnl = paper.pnl_at(price, volume);
            paper.realized += pnl;
            paper.position.volume = crate::round_dp(open_volume - volume, 2);
            self.balance += pnl;
            info!(
                "Paper partial close {} {:.2} lots @ {}, pnl {:.2}",
                ticket, volume, price, pnl
            );
        }

        Ok(OrderReceipt {
            retcode: RETCODE_DONE,
            ticket,
            volume,
            price,
            comment: "paper close".to_string(),
        })
    }

    fn closed_trade(&mut self, ticket: u64) -> BrokerResult<Option<ClosedTrade>> {
        Ok(self.closed.get(&ticket).cloned())
    }
}
