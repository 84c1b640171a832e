/// partial payments - several payments against one due date, interest first
use loan_ledger_rs::{InMemoryStore, Ledger, LoanTerms, Money, PaymentRequest, Rate, SafeTimeProvider, TimeSource};
use chrono::{NaiveDate, TimeZone, Utc};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== partial payments ===\n");

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2024, 1, 25, 9, 0, 0).unwrap()
    ));
    let ledger = Ledger::with_defaults(InMemoryStore::new());

    let terms = LoanTerms::monthly_simple(
        Money::from_major(10_000),
        Rate::from_percentage(5),
        10,
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
    );
    let loan = ledger.create_loan(&terms, &time)?;

    // preview shows what would spill over to the next installment
    let preview = ledger.preview_allocation(loan.id, Money::from_major(2_000))?;
    println!(
        "preview 2000: interest {}, principal {}, applies to next {}",
        preview.interest_applied, preview.principal_applied, preview.excess
    );

    for amount in [300, 400, 800] {
        let receipt = ledger.apply_payment(loan.id, &PaymentRequest::new(Money::from_major(amount)), &time)?;
        if let Some(allocation) = &receipt.allocation {
            println!(
                "paid {} for {}: interest {}, principal {}, completes installment: {}",
                amount,
                allocation.due_date,
                allocation.interest_applied,
                allocation.principal_applied,
                receipt.installment_paid
            );
        }
        println!("  balance {} -> {}", receipt.previous_balance, receipt.new_balance);
    }

    // paying past the current installment is refused
    if let Err(err) = ledger.apply_payment(loan.id, &PaymentRequest::new(Money::from_major(5_000)), &time) {
        println!("\nrejected: {}", err);
    }

    for event in ledger.take_events() {
        println!("{:?}", event);
    }

    Ok(())
}
