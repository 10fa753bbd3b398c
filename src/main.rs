use crosswalk::adjust::{adjust_observations, write_adjusted_csv};
use crosswalk::basis::SplineShape;
use crosswalk::data::{ColumnRoles, RawColumnRoles, load_adjustment_data, load_comparison_data};
use crosswalk::design::CovariateTerm;
use crosswalk::fit::{FitConfig, OrderPrior, fit_model};
use crosswalk::model::{FittedModel, TransformKind};

use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::process;

#[derive(Parser)]
#[command(
    name = "crosswalk",
    about = "Fit and apply crosswalk models that adjust systematically biased measurements",
    long_about = "A tool for fitting network meta-regression crosswalk models from matched \
                 comparison data, and for adjusting raw observations reported under \
                 alternative definitions onto a gold-standard definition."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransformArg {
    Log,
    Logit,
}

impl From<TransformArg> for TransformKind {
    fn from(arg: TransformArg) -> Self {
        match arg {
            TransformArg::Log => TransformKind::Log,
            TransformArg::Logit => TransformKind::Logit,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a crosswalk model from matched comparison records
    #[command(about = "Fit a crosswalk model (outputs: model.toml, fixed_effects.csv)")]
    Fit {
        /// Path to the comparison TSV file
        comparison_data: String,

        /// Atomic label of the gold-standard definition
        #[arg(long)]
        gold: String,

        /// Space the differences were computed in
        #[arg(long, value_enum)]
        transform: TransformArg,

        /// Column holding the transformed difference (alternative minus reference)
        #[arg(long, default_value = "difference")]
        observation_col: String,

        /// Column holding the standard error of the difference
        #[arg(long, default_value = "difference_se")]
        se_col: String,

        /// Column holding the alternative definition label
        #[arg(long, default_value = "alt_definition")]
        alt_col: String,

        /// Column holding the reference definition label
        #[arg(long, default_value = "ref_definition")]
        ref_col: String,

        /// Column identifying each record's heterogeneity group
        #[arg(long, default_value = "group_id")]
        group_col: String,

        /// Comma-separated covariate columns entering the model linearly
        #[arg(long, value_delimiter = ',')]
        covariates: Vec<String>,

        /// Spline covariate term as 'column:knot,knot,...:degree[:shape]'
        /// where shape is one of increasing, decreasing, convex, concave
        #[arg(long = "spline")]
        splines: Vec<String>,

        /// Order prior as 'lower<upper' on two definition labels
        #[arg(long = "order-prior")]
        order_priors: Vec<String>,

        /// Fraction of records kept after one trimming pass; 1.0 disables trimming
        #[arg(long, default_value = "1.0")]
        inlier_fraction: f64,

        /// Delimiter separating atomic labels inside composite definitions
        #[arg(long, default_value = "_")]
        delimiter: String,

        /// Output path for the fitted model
        #[arg(long, default_value = "model.toml")]
        model_out: String,

        /// Output path for the fixed-effects table
        #[arg(long, default_value = "fixed_effects.csv")]
        effects_out: String,
    },

    /// Adjust raw observations with a fitted crosswalk model
    #[command(about = "Adjust raw observations (outputs: adjusted.csv)")]
    Adjust {
        /// Path to the TSV file of raw observations
        adjustment_data: String,

        /// Path to the fitted model file (.toml)
        #[arg(long)]
        model: String,

        /// Column holding the raw measured value
        #[arg(long, default_value = "value")]
        value_col: String,

        /// Column holding the standard error of the raw value
        #[arg(long, default_value = "value_se")]
        se_col: String,

        /// Column holding the definition label of each row
        #[arg(long, default_value = "definition")]
        definition_col: String,

        /// Optional row-identifier column; sequential ids are generated when absent
        #[arg(long)]
        row_id_col: Option<String>,

        /// Output path for the adjusted rows
        #[arg(long, default_value = "adjusted.csv")]
        out: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit {
            comparison_data,
            gold,
            transform,
            observation_col,
            se_col,
            alt_col,
            ref_col,
            group_col,
            covariates,
            splines,
            order_priors,
            inlier_fraction,
            delimiter,
            model_out,
            effects_out,
        } => fit_command(
            &comparison_data,
            &gold,
            transform.into(),
            ColumnRoles {
                observation: observation_col,
                standard_error: se_col,
                alt_definition: alt_col,
                ref_definition: ref_col,
                covariates: covariates.clone(),
                group_id: group_col,
            },
            &covariates,
            &splines,
            &order_priors,
            inlier_fraction,
            &delimiter,
            &model_out,
            &effects_out,
        ),
        Commands::Adjust {
            adjustment_data,
            model,
            value_col,
            se_col,
            definition_col,
            row_id_col,
            out,
        } => adjust_command(
            &adjustment_data,
            &model,
            RawColumnRoles {
                value: value_col,
                standard_error: se_col,
                definition: definition_col,
                covariates: Vec::new(),
                row_id: row_id_col,
            },
            &out,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn fit_command(
    comparison_data_path: &str,
    gold: &str,
    transform: TransformKind,
    roles: ColumnRoles,
    linear_covariates: &[String],
    spline_specs: &[String],
    order_prior_specs: &[String],
    inlier_fraction: f64,
    delimiter: &str,
    model_out: &str,
    effects_out: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    // Spline covariates also need their columns extracted.
    let mut roles = roles;
    let spline_terms: Vec<CovariateTerm> = spline_specs
        .iter()
        .map(|spec| parse_spline_spec(spec))
        .collect::<Result<_, _>>()?;
    for term in &spline_terms {
        if let CovariateTerm::Spline { name, .. } = term
            && !roles.covariates.contains(name)
        {
            roles.covariates.push(name.clone());
        }
    }

    println!("Loading comparison data from: {}", comparison_data_path);
    let store = load_comparison_data(comparison_data_path, &roles, delimiter)?;
    println!(
        "Loaded {} comparison records across {} atomic definitions",
        store.n_records(),
        store.registry.labels().len()
    );

    let mut config = FitConfig::new(transform, gold);
    for name in linear_covariates {
        config.terms.push(CovariateTerm::Linear { name: name.clone() });
    }
    config.terms.extend(spline_terms);
    config.order_priors = order_prior_specs
        .iter()
        .map(|spec| parse_order_prior(spec))
        .collect::<Result<_, _>>()?;
    config.inlier_fraction = inlier_fraction;

    println!("Fitting crosswalk model (gold definition: '{}')...", gold);
    let model = fit_model(&store, &config)?;
    println!(
        "Fit complete: heterogeneity variance = {:.6e}",
        model.heterogeneity_variance
    );

    model.save(model_out)?;
    println!("Model saved to: {}", model_out);

    model.write_fixed_effects_csv(File::create(effects_out)?)?;
    println!("Fixed effects saved to: {}", effects_out);

    Ok(())
}

fn adjust_command(
    adjustment_data_path: &str,
    model_path: &str,
    roles: RawColumnRoles,
    out: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", model_path);
    let model = FittedModel::load(model_path)?;

    let mut roles = roles;
    roles.covariates = model
        .required_covariates()
        .into_iter()
        .map(str::to_string)
        .collect();
    if !roles.covariates.is_empty() {
        println!("Model requires covariates: {}", roles.covariates.join(", "));
    }

    println!("Loading observations from: {}", adjustment_data_path);
    let data = load_adjustment_data(adjustment_data_path, &roles, &model.delimiter)?;
    println!("Loaded {} observations for adjustment", data.n_rows());

    let adjusted = adjust_observations(&model, &data)?;

    write_adjusted_csv(&adjusted, File::create(out)?)?;
    println!("Adjusted observations saved to: {}", out);

    Ok(())
}

/// Parses 'column:knot,knot,...:degree[:shape]' into a spline term.
fn parse_spline_spec(spec: &str) -> Result<CovariateTerm, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 3 || parts.len() > 4 {
        return Err(format!(
            "Invalid spline spec '{}': expected 'column:knot,knot,...:degree[:shape]'",
            spec
        ));
    }

    let name = parts[0].trim();
    if name.is_empty() {
        return Err(format!("Invalid spline spec '{}': empty column name", spec));
    }

    let knots: Vec<f64> = parts[1]
        .split(',')
        .map(|k| {
            k.trim()
                .parse::<f64>()
                .map_err(|_| format!("Invalid spline spec '{}': bad knot '{}'", spec, k))
        })
        .collect::<Result<_, _>>()?;

    let degree: usize = parts[2]
        .trim()
        .parse()
        .map_err(|_| format!("Invalid spline spec '{}': bad degree '{}'", spec, parts[2]))?;

    let shape = match parts.get(3).map(|s| s.trim()) {
        None => SplineShape::Unconstrained,
        Some("increasing") => SplineShape::Increasing,
        Some("decreasing") => SplineShape::Decreasing,
        Some("convex") => SplineShape::Convex,
        Some("concave") => SplineShape::Concave,
        Some(other) => {
            return Err(format!(
                "Invalid spline spec '{}': unknown shape '{}'",
                spec, other
            ));
        }
    };

    Ok(CovariateTerm::Spline {
        name: name.to_string(),
        knots,
        degree,
        shape,
    })
}

/// Parses 'lower<upper' into an order prior on two definition labels.
fn parse_order_prior(spec: &str) -> Result<OrderPrior, String> {
    match spec.split_once('<') {
        Some((lower, upper)) if !lower.trim().is_empty() && !upper.trim().is_empty() => {
            Ok(OrderPrior {
                lower: lower.trim().to_string(),
                upper: upper.trim().to_string(),
            })
        }
        _ => Err(format!(
            "Invalid order prior '{}': expected 'lower<upper'",
            spec
        )),
    }
}
