//! 検証損失を監視するコールバック（学習率の段階的縮小・早期終了）
//!
//! どちらもエポック末に検証損失を1回ずつ受け取る状態機械。

/// 学習率縮小の設定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlateauConfig {
    /// 縮小時に掛ける係数
    pub factor: f64,
    /// 改善なしで待つエポック数
    pub patience: usize,
    /// 学習率の下限
    pub min_lr: f64,
    /// 改善とみなす最小の減少幅
    pub min_delta: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.2,
            patience: 2,
            min_lr: 1e-5,
            min_delta: 1e-4,
        }
    }
}

/// 検証損失が停滞したら学習率を `factor` 倍する
#[derive(Debug, Clone)]
pub struct ReduceOnPlateau {
    config: PlateauConfig,
    lr: f64,
    best: f64,
    wait: usize,
}

impl ReduceOnPlateau {
    pub fn new(initial_lr: f64, config: PlateauConfig) -> Self {
        Self {
            config,
            lr: initial_lr,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// 現在の学習率
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// エポック末の検証損失を渡し、次エポックの学習率を返す
    pub fn observe(&mut self, loss: f64) -> f64 {
        if loss < self.best - self.config.min_delta {
            self.best = loss;
            self.wait = 0;
            return self.lr;
        }

        self.wait += 1;
        if self.wait >= self.config.patience {
            let reduced = (self.lr * self.config.factor).max(self.config.min_lr);
            if reduced < self.lr {
                tracing::info!("検証損失が停滞: 学習率 {:.2e} -> {:.2e}", self.lr, reduced);
                self.lr = reduced;
            }
            self.wait = 0;
        }
        self.lr
    }
}

/// [`EarlyStopping::observe`] の判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 最良値を更新した（この時点の重みを保存すべき）
    Improved,
    Continue,
    Stop,
}

/// 検証損失が `patience` エポック改善しなければ終了する
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
    epoch: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            best_epoch: None,
            wait: 0,
            epoch: 0,
        }
    }

    /// 最良の検証損失とそのエポック（1始まり）
    pub fn best(&self) -> Option<(usize, f64)> {
        self.best_epoch.map(|epoch| (epoch, self.best))
    }

    pub fn observe(&mut self, loss: f64) -> Verdict {
        self.epoch += 1;
        if loss < self.best {
            self.best = loss;
            self.best_epoch = Some(self.epoch);
            self.wait = 0;
            return Verdict::Improved;
        }

        self.wait += 1;
        if self.patience > 0 && self.wait >= self.patience {
            Verdict::Stop
        } else {
            Verdict::Continue
        }
    }
}
