use thiserror::Error;

use crate::{
    ir::Program,
    logger::Logger,
    options::Options,
    passes::{
        CdlaError,
        GdlrError,
        ICallError,
        ICallLimiterPass,
        LayoutRandomizerPass,
        LayoutStatistics,
        LeakageAnalysisPass,
        Pass,
        PromoteError,
        PromotePass,
        PromotionStatistics,
        Statistics,
        VerifyError,
        VerifyPass,
    },
};

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum HardenError {
    #[error("Leakage analysis failed: {0}")]
    CdlaError(#[from] CdlaError),

    #[error("Indirect call limiter failed: {0}")]
    ICallError(#[from] ICallError),

    #[error("Local-to-global promotion failed: {0}")]
    PromoteError(#[from] PromoteError),

    #[error("Layout randomization failed: {0}")]
    GdlrError(#[from] GdlrError),

    #[error("Verification failed: {0}")]
    VerificationError(#[from] VerifyError),
}

/// Everything [`Hardener::harden`] produces
#[derive(Debug)]
pub struct Report {
    /// The hardened program
    pub program: Program,
    /// Leakage of the program before and after hardening
    pub statistics: Statistics,
    pub layout: LayoutStatistics,
    pub promotion: PromotionStatistics,
    pub limited_calls: usize,
    /// Anomalies the passes logged as warnings
    pub warnings: usize,
}

/// Drives the hardening pipeline over a [`Program`].
///
/// The order is fixed: leakage analysis of the original code, local-to-global promotion,
/// indirect call limiting, global data layout randomization and finally the leakage analysis
/// of the hardened code. Disabled passes are skipped. The program is verified on entry and after
/// every pass that modified it.
#[derive(Debug)]
pub struct Hardener {
    program: Program,
    options: Options,
    modified: bool,
    warnings: usize,
}

impl Hardener {
    pub fn new(program: Program, options: Options) -> Result<Self, VerifyError> {
        let mut hardener = Self {
            program,
            options,
            modified: false,
            warnings: 0,
        };

        hardener.verify()?;
        Ok(hardener)
    }

    /// Run a single pass over the program
    pub fn run_pass<P>(&mut self, pass: &mut P) -> Result<bool, P::Error>
    where
        P: Pass,
    {
        let mut logger = Logger::spinner();
        logger.set_title(format!("Running Pass: {}", pass.name()));
        logger.set_prefix(pass.name());

        let ret = pass.run(&mut self.program, &logger);

        logger.clear_prefix();
        self.warnings += logger.num_warnings();

        if let Ok(true) = ret {
            self.modified = true;
        }

        ret
    }

    fn verify(&mut self) -> Result<(), VerifyError> {
        let mut verifier = VerifyPass::new();
        self.run_pass(&mut verifier)?;
        self.modified = false;
        Ok(())
    }

    fn run_mutating_pass<P>(&mut self, pass: &mut P) -> Result<(), HardenError>
    where
        P: Pass,
        HardenError: From<P::Error>,
    {
        if self.run_pass(pass)? {
            self.verify()?;
        }
        Ok(())
    }

    /// Run the whole pipeline and hand back the hardened program together with all statistics
    pub fn harden(mut self) -> Result<Report, HardenError> {
        let mut statistics = Statistics::default();

        /* Measured on the unmodified program */
        let mut baseline = LeakageAnalysisPass::new(false);
        self.run_pass(&mut baseline)?;
        statistics.merge(baseline.statistics());

        let mut promotion = PromotionStatistics::default();
        if self.options.enable_lgpromote() {
            let mut pass = PromotePass::new();
            self.run_mutating_pass(&mut pass)?;
            promotion = *pass.statistics();
        }

        let mut limited_calls = 0;
        if self.options.enable_icall_limiter() {
            let mut pass = ICallLimiterPass::new();
            self.run_mutating_pass(&mut pass)?;
            limited_calls = pass.num_limited_calls();
        }

        /* Also collects the section sizes when randomization is disabled */
        let mut gdlr = LayoutRandomizerPass::new(&self.options);
        self.run_mutating_pass(&mut gdlr)?;
        let layout = *gdlr.statistics();

        let mut transformed = LeakageAnalysisPass::new(true);
        self.run_pass(&mut transformed)?;
        statistics.merge(transformed.statistics());

        if self.modified {
            self.verify()?;
        }

        let logger = Logger::spinner();
        logger.summary(
            "Leakable code bytes",
            &[("before", statistics.original.code_size_leakable), ("after", statistics.transformed.code_size_leakable)],
        );

        if self.warnings > 0 {
            logger.warning(format!("The passes reported {} anomalies", self.warnings));
        }

        Ok(Report {
            program: self.program,
            statistics,
            layout,
            promotion,
            limited_calls,
            warnings: self.warnings,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}
