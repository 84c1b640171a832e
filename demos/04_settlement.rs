/// settlement - close a loan early with partial interest forgiveness
use loan_ledger_rs::{
    InMemoryStore, Ledger, LoanTerms, Money, PaymentRequest, Rate, SafeTimeProvider, SettlementRequest,
    TimeSource,
};
use chrono::{Duration, NaiveDate, TimeZone, Utc};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== settlement ===\n");

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2024, 1, 25, 9, 0, 0).unwrap()
    ));
    let controller = time.test_control().unwrap();
    let ledger = Ledger::with_defaults(InMemoryStore::new());

    let terms = LoanTerms::monthly_simple(
        Money::from_major(6_000),
        Rate::from_percentage(3),
        6,
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
    );
    let loan = ledger.create_loan(&terms, &time)?;
    ledger.apply_payment(loan.id, &PaymentRequest::new(Money::from_major(1_180)), &time)?;

    controller.advance(Duration::days(20));
    let today = time.now().date_naive();
    let breakdown = ledger.compute_settlement(loan.id, today)?;
    println!("capital pending:  {}", breakdown.capital_pending);
    println!("interest pending: {}", breakdown.interest_pending);
    println!("late fee pending: {}", breakdown.late_fee_pending);
    println!("total to settle:  {}", breakdown.total_to_settle);

    // capital must be paid in full
    let short = SettlementRequest {
        capital: breakdown.capital_pending - Money::from_major(100),
        ..SettlementRequest::full(&breakdown)
    };
    if let Err(err) = ledger.apply_settlement(loan.id, &short, &time) {
        println!("\nrejected: {}", err);
    }

    // interest may be partly forgiven
    let request = SettlementRequest {
        interest: Money::from_major(180),
        reference: Some("early payoff".to_string()),
        ..SettlementRequest::full(&breakdown)
    };
    let receipt = ledger.apply_settlement(loan.id, &request, &time)?;
    println!(
        "\nsettled {} rows: paid {}, forgiven {}",
        receipt.settled_rows,
        receipt.terms.total_paid(),
        receipt.terms.total_forgiven()
    );

    let view = ledger.loan_view(loan.id, today)?;
    println!("{}", view.to_json_pretty()?);

    Ok(())
}
